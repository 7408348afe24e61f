//! Synthetic smart meters for local runs
//!
//! Publishes one reading per meter every interval until Ctrl+C.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::models::MeterReading;
use crate::transport::{MeterTransport, TransportError};

/// Average outdoor temperature the simulated meters report around
pub const BASE_TEMPERATURE: f64 = 8.0;

/// Meter ids used when none are given
pub fn default_meters() -> Vec<String> {
    (1..=5).map(|i| format!("household_{}", i)).collect()
}

/// Typical household draw in kWh for an hour of the day
pub fn base_consumption(hour: u32) -> f64 {
    match hour {
        0..=5 => 0.2,
        6..=8 => 1.5,
        9..=11 => 0.8,
        12..=13 => 1.2,
        14..=17 => 0.7,
        18..=20 => 1.9,
        _ => 0.5,
    }
}

pub fn generate_reading<R: Rng + ?Sized>(
    meter_id: &str,
    at: DateTime<Utc>,
    rng: &mut R,
) -> MeterReading {
    let hour = at.hour();

    let variance = rng.gen_range(0.7..1.3);
    let consumption = base_consumption(hour) * variance;

    let hour_variance = f64::from(hour % 12) - 6.0;
    let temperature = BASE_TEMPERATURE + hour_variance + rng.gen_range(-2.0..2.0);

    MeterReading {
        meter_id: meter_id.to_string(),
        timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        temperature: (temperature * 10.0).trunc() / 10.0,
        consumption_kwh: (consumption * 100.0).trunc() / 100.0,
    }
}

/// Publish a reading for every meter, then again on each tick, until Ctrl+C
pub async fn run(
    transport: &MeterTransport,
    meters: &[String],
    interval: Duration,
) -> Result<(), TransportError> {
    info!(meters = meters.len(), interval_secs = interval.as_secs(), "Meter simulator started");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => publish_all(transport, meters).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down simulator");
                break;
            }
        }
    }

    transport.flush().await
}

async fn publish_all(transport: &MeterTransport, meters: &[String]) {
    let now = Utc::now();
    // thread_rng is not Send, keep it out of the await points
    let readings: Vec<MeterReading> = {
        let mut rng = rand::thread_rng();
        meters
            .iter()
            .map(|meter_id| generate_reading(meter_id, now, &mut rng))
            .collect()
    };

    for reading in readings {
        match transport.publish(&reading).await {
            Ok(()) => info!(
                meter_id = %reading.meter_id,
                consumption_kwh = reading.consumption_kwh,
                temperature = reading.temperature,
                "Published reading"
            ),
            Err(e) => warn!(meter_id = %reading.meter_id, error = %e, "Failed to publish reading"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_base_consumption_day_parts() {
        assert_eq!(base_consumption(3), 0.2);
        assert_eq!(base_consumption(7), 1.5);
        assert_eq!(base_consumption(19), 1.9);
        assert_eq!(base_consumption(23), 0.5);
    }

    #[test]
    fn test_generated_readings_stay_in_band() {
        let mut rng = StdRng::seed_from_u64(11);
        let at = Utc.with_ymd_and_hms(2024, 12, 5, 19, 0, 0).unwrap();

        for _ in 0..200 {
            let reading = generate_reading("household_1", at, &mut rng);
            assert!(reading.consumption_kwh >= 1.9 * 0.7 - 0.01);
            assert!(reading.consumption_kwh <= 1.9 * 1.3);
            // hour 19 -> 8 + (7 - 6) = 9 degrees, +/- 2
            assert!((6.9..=11.0).contains(&reading.temperature));
            assert_eq!(reading.timestamp, "2024-12-05T19:00:00Z");
            assert!(reading.parsed_timestamp().is_some());
        }
    }
}
