/// Some hardware performance counter count, such as retired conditional
/// branches, used as a deterministic progress metric.
pub type Ticks = u64;
