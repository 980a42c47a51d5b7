use crate::errors::ConfigError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanPoint {
    pub temp: i32,
    pub duty: u32,
}

impl FanPoint {
    pub fn new(temp: i32, duty: u32) -> Self {
        Self { temp, duty }
    }
}

/// Piecewise-linear mapping from temperature to fan duty.
///
/// Points are unique by temperature and sorted ascending; a curve always has
/// at least one point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanCurve {
    points: Vec<FanPoint>,
}

impl FanCurve {
    /// Build a curve from points in any order. Later points replace earlier
    /// ones with the same temperature.
    pub fn from_points<I>(points: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = FanPoint>,
    {
        let mut by_temp = BTreeMap::new();
        for point in points {
            if point.duty > 100 {
                return Err(ConfigError::DutyOutOfRange {
                    temp: point.temp,
                    duty: point.duty as i32,
                });
            }
            by_temp.insert(point.temp, point.duty);
        }

        if by_temp.is_empty() {
            return Err(ConfigError::EmptyCurve);
        }

        Ok(Self {
            points: by_temp
                .into_iter()
                .map(|(temp, duty)| FanPoint::new(temp, duty))
                .collect(),
        })
    }

    pub fn points(&self) -> &[FanPoint] {
        &self.points
    }

    pub fn min_temp(&self) -> i32 {
        self.points[0].temp
    }

    pub fn min_duty(&self) -> u32 {
        self.points[0].duty
    }

    /// Fan duty percentage for a temperature.
    ///
    /// Clamps to the first point's duty below the curve and the last point's
    /// duty at or above it. Between points the duty is floored.
    pub fn interpolate(&self, temp: i32) -> u32 {
        if temp < self.min_temp() {
            return self.min_duty();
        }

        for pair in self.points.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if temp < next.temp {
                let delta_temp = i64::from(next.temp) - i64::from(prev.temp);
                let delta_duty = i64::from(next.duty) - i64::from(prev.duty);
                let temp_diff = i64::from(temp) - i64::from(prev.temp);
                let duty = i64::from(prev.duty) + (temp_diff * delta_duty).div_euclid(delta_temp);
                return duty as u32;
            }
        }

        self.points[self.points.len() - 1].duty
    }
}

impl FromStr for FanCurve {
    type Err = ConfigError;

    /// Parse `temperature:duty` pairs separated by commas, e.g. `40:30,60:60,80:100`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ConfigError::EmptyCurve);
        }

        let points = s
            .split(',')
            .map(|pair| {
                let malformed = || ConfigError::MalformedPoint(pair.trim().to_string());
                let (temp, duty) = pair.split_once(':').ok_or_else(malformed)?;
                let temp: i32 = temp.trim().parse().map_err(|_| malformed())?;
                let duty: i32 = duty.trim().parse().map_err(|_| malformed())?;
                if !(0..=100).contains(&duty) {
                    return Err(ConfigError::DutyOutOfRange { temp, duty });
                }
                Ok(FanPoint::new(temp, duty as u32))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_points(points)
    }
}

impl fmt::Display for FanCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, point) in self.points.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", point.temp, point.duty)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn curve(spec: &str) -> FanCurve {
        spec.parse().unwrap()
    }

    #[test_case(50, 45 ; "between first two points")]
    #[test_case(90, 100 ; "above the last point")]
    #[test_case(10, 30 ; "below the first point")]
    #[test_case(40, 30 ; "first point")]
    #[test_case(60, 60 ; "middle point")]
    #[test_case(80, 100 ; "last point")]
    #[test_case(79, 98 ; "just under the last point")]
    fn test_fan_curve_interpolation(temp: i32, expected: u32) {
        assert_eq!(curve("40:30,60:60,80:100").interpolate(temp), expected);
    }

    #[test]
    fn test_interpolation_floors_between_points() {
        let curve = curve("30:0,60:50,90:100");
        assert_eq!(curve.interpolate(65), 58);
        assert_eq!(curve.interpolate(95), 100);
        assert_eq!(curve.interpolate(25), 0);
    }

    #[test]
    fn test_falling_segment_floors_toward_lower_duty() {
        // 70 -> 80 drops from 60% to 40%: 60 + floor(3 * -20 / 10) = 54
        let curve = curve("50:30,70:60,80:40");
        assert_eq!(curve.interpolate(73), 54);
        // floor(2 * -1 / 10) is -1, not 0
        let curve = curve_from(&[(0, 10), (10, 9)]);
        assert_eq!(curve.interpolate(2), 9);
    }

    fn curve_from(points: &[(i32, u32)]) -> FanCurve {
        FanCurve::from_points(points.iter().map(|&(t, d)| FanPoint::new(t, d))).unwrap()
    }

    #[test]
    fn test_exact_at_every_point() {
        let curve = curve("20:15,35:22,47:40,61:38,75:90,88:100");
        for point in curve.points() {
            assert_eq!(curve.interpolate(point.temp), point.duty);
        }
    }

    #[test]
    fn test_parse_sorts_and_last_duplicate_wins() {
        let curve = curve(" 80:100, 40:30 ,60:50,60:60");
        assert_eq!(
            curve.points(),
            &[
                FanPoint::new(40, 30),
                FanPoint::new(60, 60),
                FanPoint::new(80, 100)
            ]
        );
        assert_eq!(curve.min_temp(), 40);
        assert_eq!(curve.min_duty(), 30);
        assert_eq!(curve.to_string(), "40:30,60:60,80:100");
    }

    #[test]
    fn test_single_point_curve_is_flat() {
        let curve = curve("50:40");
        assert_eq!(curve.interpolate(20), 40);
        assert_eq!(curve.interpolate(50), 40);
        assert_eq!(curve.interpolate(99), 40);
    }

    #[test_case("" => ConfigError::EmptyCurve ; "empty")]
    #[test_case("   " => ConfigError::EmptyCurve ; "blank")]
    #[test_case("40:30,6060" => ConfigError::MalformedPoint("6060".to_string()) ; "missing separator")]
    #[test_case("40:30,hot:60" => ConfigError::MalformedPoint("hot:60".to_string()) ; "non numeric temperature")]
    #[test_case("40:3.5" => ConfigError::MalformedPoint("40:3.5".to_string()) ; "non integer duty")]
    #[test_case("40:30,," => ConfigError::MalformedPoint("".to_string()) ; "empty pair")]
    #[test_case("40:130" => ConfigError::DutyOutOfRange { temp: 40, duty: 130 } ; "duty above 100")]
    fn test_parse_rejects(spec: &str) -> ConfigError {
        spec.parse::<FanCurve>().unwrap_err()
    }
}
