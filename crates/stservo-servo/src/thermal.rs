/// Temperature thresholds for one servo, in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalLimits {
    warn_c: f32,
    critical_c: f32,
}

impl ThermalLimits {
    pub fn new(warn_c: f32, critical_c: f32) -> Self {
        Self { warn_c, critical_c }
    }

    pub fn critical_c(&self) -> f32 {
        self.critical_c
    }

    /// Critical wins over warning when both thresholds are equal.
    pub fn classify(&self, temp_c: f32) -> ThermalLevel {
        if temp_c >= self.critical_c {
            ThermalLevel::Critical
        } else if temp_c >= self.warn_c {
            ThermalLevel::Warning
        } else {
            ThermalLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalLevel {
    Normal,
    Warning,
    Critical,
}
