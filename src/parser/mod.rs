//! Output parsing (C5): turns raw model text into validated structured
//! results, tolerant of the small deviations real model output exhibits.

pub mod stage1;
pub mod stage2;
