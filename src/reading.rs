//! The in-memory reading and its display formatting

use serde::Serialize;

/// Timestamp format used for the date-time display
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cellular signal strength as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStrength {
    /// Discrete level 0-4 (none, poor, moderate, good, great)
    Level(u8),
    /// Raw GSM signal strength in ASU (0-31)
    Gsm { asu: u8 },
}

impl SignalStrength {
    /// dBm value derived from GSM ASU; `None` for discrete levels
    pub fn dbm(&self) -> Option<i32> {
        match self {
            SignalStrength::Level(_) => None,
            SignalStrength::Gsm { asu } => Some(-113 + 2 * i32::from(*asu)),
        }
    }

    pub fn display(&self) -> String {
        match self {
            SignalStrength::Level(level) => format!("Signal Strength Level: {}", level),
            SignalStrength::Gsm { .. } => {
                format!("Signal Strength: {} dBm", self.dbm().unwrap_or_default())
            }
        }
    }
}

/// A location fix in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn display(&self) -> String {
        format!(
            "Latitude: {}, Longitude: {}",
            format_coordinate(self.latitude),
            format_coordinate(self.longitude)
        )
    }

    /// Great-circle distance to `other` in meters
    pub fn distance_m(&self, other: &Fix) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// Five decimal digits, rounding the shortest decimal form of `value`
/// half-up (away from zero), so 45.123455 renders as 45.12346.
pub fn format_coordinate(value: f64) -> String {
    const DIGITS: usize = 5;

    if !value.is_finite() {
        return format!("{:.5}", value);
    }

    let shortest = format!("{}", value.abs());
    let (int_part, frac_part) = shortest.split_once('.').unwrap_or((shortest.as_str(), ""));

    // Integer and kept fraction digits as one run, rounded as an integer
    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes().chain(std::iter::repeat(b'0')).take(DIGITS))
        .map(|b| b - b'0')
        .collect();

    if frac_part.as_bytes().get(DIGITS).is_some_and(|b| *b >= b'5') {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, 1);
                break;
            }
            i -= 1;
            if digits[i] == 9 {
                digits[i] = 0;
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let split = digits.len() - DIGITS;
    let render = |run: &[u8]| run.iter().map(|d| char::from(b'0' + d)).collect::<String>();
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, render(&digits[..split]), render(&digits[split..]))
}

pub fn battery_display(percent: u8) -> String {
    format!("Battery Level: {}%", percent)
}

/// Latest known values. Fields are updated independently by the trigger
/// and by each sensor source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub timestamp: Option<String>,
    pub signal: Option<SignalStrength>,
    pub battery_percent: Option<u8>,
    pub location: Option<Fix>,
}

impl Reading {
    /// Stamp the reading with the current local time
    pub fn touch(&mut self) {
        self.timestamp = Some(chrono::Local::now().format(TIMESTAMP_FORMAT).to_string());
    }

    /// Render the four display fields; unset fields are empty
    pub fn display(&self) -> ReadingDisplay {
        ReadingDisplay {
            date_time: self.timestamp.clone().unwrap_or_default(),
            signal: self.signal.map(|s| s.display()).unwrap_or_default(),
            battery: self.battery_percent.map(battery_display).unwrap_or_default(),
            location: self.location.map(|f| f.display()).unwrap_or_default(),
        }
    }
}

/// What the four read-only displays show
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadingDisplay {
    pub date_time: String,
    pub signal: String,
    pub battery: String,
    pub location: String,
}

impl ReadingDisplay {
    /// One CSV line, newline-terminated. Fields are written verbatim with
    /// no quoting or escaping.
    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.date_time, self.signal, self.battery, self.location
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_display() {
        assert_eq!(battery_display(57), "Battery Level: 57%");
    }

    #[test]
    fn test_location_display_rounds_to_five_digits() {
        let fix = Fix::new(45.1234567, -73.9876543);
        assert_eq!(fix.display(), "Latitude: 45.12346, Longitude: -73.98765");
    }

    #[test]
    fn test_location_display_rounds_ties_up() {
        let fix = Fix::new(45.123455, -73.987655);
        assert_eq!(fix.display(), "Latitude: 45.12346, Longitude: -73.98766");
    }

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(0.0), "0.00000");
        assert_eq!(format_coordinate(1.5), "1.50000");
        assert_eq!(format_coordinate(-0.1234549), "-0.12345");
        assert_eq!(format_coordinate(0.999995), "1.00000");
        assert_eq!(format_coordinate(-179.999995), "-180.00000");
        assert_eq!(format_coordinate(12.000001), "12.00000");
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(
            SignalStrength::Level(2).display(),
            "Signal Strength Level: 2"
        );
        assert_eq!(
            SignalStrength::Gsm { asu: 10 }.display(),
            "Signal Strength: -93 dBm"
        );
        assert_eq!(SignalStrength::Level(3).dbm(), None);
    }

    #[test]
    fn test_unset_fields_render_empty() {
        let reading = Reading::default();
        let display = reading.display();
        assert_eq!(display, ReadingDisplay::default());
        assert_eq!(display.csv_line(), ",,,\n");
    }

    #[test]
    fn test_csv_line_does_not_escape_commas() {
        let reading = Reading {
            timestamp: Some("2024-05-01 10:00:00".to_string()),
            signal: Some(SignalStrength::Level(4)),
            battery_percent: Some(80),
            location: Some(Fix::new(1.0, 2.0)),
        };
        assert_eq!(
            reading.display().csv_line(),
            "2024-05-01 10:00:00,Signal Strength Level: 4,Battery Level: 80%,Latitude: 1.00000, Longitude: 2.00000\n"
        );
    }

    #[test]
    fn test_touch_sets_timestamp() {
        let mut reading = Reading::default();
        reading.touch();
        let ts = reading.timestamp.unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_distance() {
        let a = Fix::new(45.0, -73.0);
        assert!(a.distance_m(&a) < 1e-6);

        // One thousandth of a degree of latitude is roughly 111 m
        let b = Fix::new(45.001, -73.0);
        let d = a.distance_m(&b);
        assert!((d - 111.2).abs() < 1.0, "distance was {}", d);
    }
}
