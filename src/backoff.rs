/// Exponential backoff for repeated probes: each consecutive probe stretches
///  the wait before the next one, capped at a maximum multiple of the base
///  interval. Any sign of life from the peer resets the stretch.
pub struct ExponentialBackoff {
    multiplier_eighths: u32,

    config_max_multiplier_eighths: u32,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    const ONE: u32 = 8;

    /// `max_multiplier` caps the stretch; `factor_eighths` is the per-probe
    ///  growth factor in units of 1/8, e.g. 16 for doubling, 12 for x1.5
    pub fn new(max_multiplier: u32, factor_eighths: u32) -> ExponentialBackoff {
        assert!(factor_eighths >= Self::ONE);
        assert!(max_multiplier >= 1);

        ExponentialBackoff {
            multiplier_eighths: Self::ONE,
            config_max_multiplier_eighths: max_multiplier * Self::ONE,
            config_factor_eighths: factor_eighths,
        }
    }

    /// interval multiplier for the probe being sent now; stretches the
    ///  multiplier for the next call
    #[must_use]
    pub fn advance(&mut self) -> u32 {
        let current = self.multiplier_eighths / Self::ONE;

        self.multiplier_eighths = (self.multiplier_eighths * self.config_factor_eighths) >> 3;
        self.multiplier_eighths = self.multiplier_eighths.min(self.config_max_multiplier_eighths);

        current
    }

    pub fn reset(&mut self) {
        self.multiplier_eighths = Self::ONE;
    }
}
