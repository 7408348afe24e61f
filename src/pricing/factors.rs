//! Factor tables for the two pricing modes
//!
//! Each factor depends on exactly one input dimension. The household and
//! context-free tables are kept separate and are not reconciled.

use crate::models::{HeatingType, HouseholdContext};

/// Consumption above this many kWh raises the price
pub const CONSUMPTION_THRESHOLD_KWH: f64 = 3.0;

fn is_winter(month: u32) -> bool {
    matches!(month, 12 | 1 | 2)
}

fn is_summer(month: u32) -> bool {
    matches!(month, 6..=8)
}

/// Factors used when a household context is available
pub mod household {
    use super::*;

    pub const BASE_PRICE: f64 = 0.12;
    pub const BASELINE_CONFIDENCE: i32 = 92;

    /// Keyword match on region and city, first match wins
    pub fn region(ctx: &HouseholdContext) -> f64 {
        let place = format!("{} {}", ctx.region, ctx.city).to_lowercase();
        let mentions = |keys: &[&str]| keys.iter().any(|k| place.contains(k));

        if mentions(&["lombardia", "milano"]) {
            1.05
        } else if mentions(&["sicilia", "sardegna"]) {
            1.12
        } else if mentions(&["lazio", "roma"]) {
            1.08
        } else {
            1.0
        }
    }

    pub fn members(members: u32) -> f64 {
        match members {
            m if m > 4 => 1.10,
            m if m <= 2 => 0.95,
            _ => 1.0,
        }
    }

    pub fn area(area_sqm: f64) -> f64 {
        if area_sqm > 150.0 {
            1.07
        } else if area_sqm < 60.0 {
            0.98
        } else {
            1.0
        }
    }

    /// Heating type, building age and season compound into one factor
    pub fn efficiency(heating: HeatingType, year_built: i32, month: u32) -> f64 {
        let mut factor = match heating {
            HeatingType::Electric => 0.90,
            HeatingType::HeatPump => 0.85,
            HeatingType::NaturalGas => 1.05,
            HeatingType::Biomass => 1.0,
        };

        if year_built < 1980 {
            factor *= 1.10;
        } else if year_built > 2015 {
            factor *= 0.92;
        }

        if is_winter(month) {
            factor *= 1.15;
        } else if is_summer(month) {
            factor *= 1.10;
        }

        factor
    }

    /// Day-part table: night cheapest, morning and evening peaks
    pub fn time_of_day(hour: u8) -> f64 {
        match hour {
            23 | 0..=6 => 0.75,
            8..=11 => 1.30,
            19 | 20 => 1.40,
            _ => 1.05,
        }
    }

    pub fn temperature(celsius: f64) -> f64 {
        if celsius < 2.0 {
            1.25
        } else if celsius > 32.0 {
            1.20
        } else if (18.0..=24.0).contains(&celsius) {
            0.90
        } else {
            1.0
        }
    }

    pub fn consumption(kwh: f64) -> f64 {
        1.0 + 0.05 * (kwh - CONSUMPTION_THRESHOLD_KWH).max(0.0)
    }

    pub fn confidence(ctx: &HouseholdContext, celsius: f64) -> i32 {
        let mut confidence = BASELINE_CONFIDENCE;
        if ctx.members >= 5 || ctx.area_sqm >= 200.0 {
            confidence -= 4;
        }
        if ctx.year_built < 1960 {
            confidence -= 5;
        }
        if !(-5.0..=40.0).contains(&celsius) {
            confidence -= 10;
        }
        confidence
    }
}

/// Factors used when no household context is available
pub mod context_free {
    use super::*;

    pub const BASE_PRICE: f64 = 0.10;
    pub const BASELINE_CONFIDENCE: i32 = 85;

    pub fn time_of_day(hour: u8) -> f64 {
        match hour {
            23 | 0..=6 => 0.80,
            8..=11 => 1.20,
            19 | 20 => 1.25,
            _ => 1.0,
        }
    }

    pub fn temperature(celsius: f64) -> f64 {
        if celsius < 5.0 {
            1.15
        } else if celsius > 30.0 {
            1.10
        } else if (18.0..=24.0).contains(&celsius) {
            0.95
        } else {
            1.0
        }
    }

    pub fn consumption(kwh: f64) -> f64 {
        1.0 + 0.04 * (kwh - CONSUMPTION_THRESHOLD_KWH).max(0.0)
    }

    pub fn confidence(celsius: f64, kwh: f64) -> i32 {
        let mut confidence = BASELINE_CONFIDENCE;
        if (18.0..=24.0).contains(&celsius) {
            confidence += 5;
        }
        if !(-5.0..=40.0).contains(&celsius) {
            confidence -= 10;
        }
        if kwh > CONSUMPTION_THRESHOLD_KWH {
            confidence -= 3;
        }
        confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HouseholdStatus;

    fn ctx(region: &str, city: &str) -> HouseholdContext {
        HouseholdContext {
            id: "house_001".to_string(),
            user_id: 1,
            meter_id: "household_1".to_string(),
            region: region.to_string(),
            city: city.to_string(),
            members: 3,
            area_sqm: 90.0,
            year_built: 2000,
            heating_type: HeatingType::Biomass,
            status: HouseholdStatus::Active,
        }
    }

    #[test]
    fn test_region_keywords() {
        assert_eq!(household::region(&ctx("Sicilia", "Palermo")), 1.12);
        assert_eq!(household::region(&ctx("", "Milano")), 1.05);
        assert_eq!(household::region(&ctx("LAZIO", "")), 1.08);
        assert_eq!(household::region(&ctx("Piemonte", "Torino")), 1.0);
    }

    #[test]
    fn test_time_table_boundaries() {
        assert_eq!(household::time_of_day(6), 0.75);
        assert_eq!(household::time_of_day(7), 1.05);
        assert_eq!(household::time_of_day(8), 1.30);
        assert_eq!(household::time_of_day(12), 1.05);
        assert_eq!(household::time_of_day(19), 1.40);
        assert_eq!(household::time_of_day(21), 1.05);
        assert_eq!(household::time_of_day(23), 0.75);
    }

    #[test]
    fn test_consumption_scales_with_excess() {
        assert_eq!(household::consumption(2.0), 1.0);
        assert_eq!(household::consumption(3.0), 1.0);
        assert!((household::consumption(5.0) - 1.10).abs() < 1e-12);
        assert!(household::consumption(7.0) > household::consumption(5.0));
    }

    #[test]
    fn test_efficiency_compounds_season() {
        let winter = household::efficiency(HeatingType::NaturalGas, 1975, 1);
        let spring = household::efficiency(HeatingType::NaturalGas, 1975, 4);
        let summer = household::efficiency(HeatingType::NaturalGas, 1975, 7);
        assert!(winter > summer && summer > spring);
        assert!(
            household::efficiency(HeatingType::HeatPump, 2020, 4)
                < household::efficiency(HeatingType::Electric, 2020, 4)
        );
    }

    #[test]
    fn test_context_free_confidence_table() {
        assert_eq!(context_free::confidence(20.0, 1.0), 90);
        assert_eq!(context_free::confidence(10.0, 1.0), 85);
        assert_eq!(context_free::confidence(-10.0, 4.0), 72);
    }
}
