//! Down-only temperature hysteresis

/// At or below this temperature readings pass straight through.
pub const HYSTERESIS_FLOOR: i32 = 50;

/// Smooths falling temperature readings while tracking rises immediately.
///
/// A falling reading is only accepted once it has dropped by at least `band`
/// below the held temperature. Readings at or below [`HYSTERESIS_FLOOR`], or a
/// non-positive band, bypass the filter.
#[derive(Debug, Clone)]
pub struct HysteresisFilter {
    band: i32,
    floor: i32,
    control_temp: Option<i32>,
}

impl HysteresisFilter {
    pub fn new(band: i32) -> Self {
        Self {
            band,
            floor: HYSTERESIS_FLOOR,
            control_temp: None,
        }
    }

    /// Last accepted temperature, `None` before the first reading
    pub fn control_temp(&self) -> Option<i32> {
        self.control_temp
    }

    /// Feed a raw reading and return the filtered temperature
    pub fn apply(&mut self, raw: i32) -> i32 {
        let accepted = match self.control_temp {
            Some(held) if self.band > 0 && raw > self.floor => {
                if raw > held || raw <= held - self.band {
                    raw
                } else {
                    held
                }
            }
            _ => raw,
        };

        self.control_temp = Some(accepted);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(band: i32, readings: &[i32]) -> Vec<i32> {
        let mut filter = HysteresisFilter::new(band);
        readings.iter().map(|&raw| filter.apply(raw)).collect()
    }

    #[test]
    fn test_holds_small_falls_and_bypasses_floor() {
        assert_eq!(run(5, &[40, 55, 53, 49, 44]), vec![40, 55, 55, 49, 44]);
    }

    #[test]
    fn test_accepts_fall_past_band() {
        assert_eq!(
            run(5, &[70, 68, 66, 65, 64, 72, 67]),
            vec![70, 70, 70, 65, 65, 72, 67]
        );
    }

    #[test]
    fn test_disabled_band_tracks_raw() {
        let readings = [70, 68, 66, 71, 52];
        assert_eq!(run(0, &readings), readings.to_vec());
        assert_eq!(run(-3, &readings), readings.to_vec());
    }

    #[test]
    fn test_first_reading_seeds_state() {
        let mut filter = HysteresisFilter::new(5);
        assert_eq!(filter.control_temp(), None);
        assert_eq!(filter.apply(80), 80);
        assert_eq!(filter.control_temp(), Some(80));
        assert_eq!(filter.apply(77), 80);
    }
}
