//! IFR clearance phraseology.

use once_cell::sync::Lazy;
use rand::{seq::SliceRandom, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::{is_squawk_code, Aviation, ClearanceFormat, SquawkRange, DEFAULT_TEMPLATE};

static RUNWAY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[0-3]?[0-9][LRC]?$").expect("runway pattern is valid"));

static SID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z0-9]{3,6}$").expect("SID pattern is valid"));

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClearanceError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid runway format {0:?}, use a format like 25R, 09L, 03C or 36")]
    InvalidRunway(String),

    #[error("Invalid SID format {0:?}, use a format like CIV1K or BIMBO2")]
    InvalidSid(String),

    #[error("No squawk code available between {min:04} and {max:04}")]
    NoSquawkAvailable { min: u16, max: u16 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingType {
    Sid,
    Rdv,
    Direct,
    #[default]
    #[serde(other)]
    AsFiled,
}

impl RoutingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingType::Sid => "SID",
            RoutingType::Rdv => "RDV",
            RoutingType::Direct => "DIRECT",
            RoutingType::AsFiled => "AS_FILED",
        }
    }
}

/// Everything needed to read out one clearance.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClearanceRequest {
    pub callsign: Option<String>,
    pub atc_station: String,
    pub atis: String,
    pub destination: Option<String>,
    /// The route as filed.
    pub route: Option<String>,
    pub routing_type: RoutingType,
    pub sid: Option<String>,
    pub waypoint: Option<String>,
    pub runway: String,
    pub initial_altitude: Option<u32>,
    pub flight_level: Option<String>,
    /// Leave empty to have one assigned.
    pub squawk: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedClearance {
    pub clearance: String,
    pub squawk: String,
    pub route_phrase: String,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The spoken routing segment, e.g. `the CIV1K departure`.
pub fn route_phrase(request: &ClearanceRequest, aviation: &Aviation) -> Result<String, ClearanceError> {
    match request.routing_type {
        RoutingType::Sid => {
            let sid = non_empty(request.sid.as_deref()).ok_or(ClearanceError::Missing("SID name"))?;
            if aviation.enable_sid_validation && !SID_PATTERN.is_match(sid) {
                return Err(ClearanceError::InvalidSid(sid.to_string()));
            }
            Ok(format!("the {sid} departure"))
        }
        RoutingType::Rdv => Ok("radar vectors".to_string()),
        RoutingType::Direct => {
            let waypoint = non_empty(request.waypoint.as_deref())
                .ok_or(ClearanceError::Missing("Direct waypoint"))?;
            Ok(format!("direct {waypoint}"))
        }
        RoutingType::AsFiled => Ok(non_empty(request.route.as_deref())
            .unwrap_or("as filed")
            .to_string()),
    }
}

/// `FL350` and `350` both read `350`; `80` reads `080`.
pub fn normalize_flight_level(level: &str) -> String {
    let level = level.trim();
    let digits = level.strip_prefix("FL").unwrap_or(level);
    format!("{digits:0>3}")
}

pub fn validate_runway(runway: &str, aviation: &Aviation) -> Result<(), ClearanceError> {
    if aviation.enable_runway_validation && !RUNWAY_PATTERN.is_match(runway) {
        return Err(ClearanceError::InvalidRunway(runway.to_string()));
    }
    Ok(())
}

/// Picks a transponder code inside `range`, skipping excluded codes and any
/// value with a digit above 7.
pub fn generate_squawk<R: Rng + ?Sized>(range: &SquawkRange, rng: &mut R) -> Result<String, ClearanceError> {
    let candidates: Vec<u16> = (range.min..=range.max)
        .filter(|code| is_squawk_code(*code) && !range.exclude.contains(code))
        .collect();

    candidates
        .choose(rng)
        .map(|code| format!("{code:04}"))
        .ok_or(ClearanceError::NoSquawkAvailable {
            min: range.min,
            max: range.max,
        })
}

pub fn render<R: Rng + ?Sized>(
    request: &ClearanceRequest,
    format: &ClearanceFormat,
    aviation: &Aviation,
    rng: &mut R,
) -> Result<RenderedClearance, ClearanceError> {
    let atc_station = request.atc_station.trim();
    if atc_station.is_empty() {
        return Err(ClearanceError::Missing("ATC call sign"));
    }
    let runway = request.runway.trim();
    if runway.is_empty() {
        return Err(ClearanceError::Missing("Departure runway"));
    }
    validate_runway(runway, aviation)?;

    let route = route_phrase(request, aviation)?;
    let squawk = match non_empty(request.squawk.as_deref()) {
        Some(code) => code.to_string(),
        None => generate_squawk(&aviation.squawk_ranges, rng)?,
    };

    let template = if format.custom_template.trim().is_empty() {
        DEFAULT_TEMPLATE
    } else {
        format.custom_template.as_str()
    };
    let initial_altitude = request
        .initial_altitude
        .map(|alt| alt.to_string())
        .unwrap_or_default();
    let flight_level = normalize_flight_level(non_empty(request.flight_level.as_deref()).unwrap_or("N/A"));

    let clearance = [
        ("{CALLSIGN}", non_empty(request.callsign.as_deref()).unwrap_or("UNKNOWN")),
        ("{ATC_STATION}", atc_station),
        ("{ATIS}", request.atis.trim()),
        ("{DESTINATION}", non_empty(request.destination.as_deref()).unwrap_or("UNKNOWN")),
        ("{ROUTE}", route.as_str()),
        ("{RUNWAY}", runway),
        ("{INITIAL_ALT}", initial_altitude.as_str()),
        ("{FLIGHT_LEVEL}", flight_level.as_str()),
        ("{SQUAWK}", squawk.as_str()),
    ]
    .into_iter()
    .fold(template.to_string(), |text, (placeholder, value)| {
        text.replace(placeholder, value)
    });

    Ok(RenderedClearance {
        clearance,
        squawk,
        route_phrase: route,
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn request() -> ClearanceRequest {
        ClearanceRequest {
            callsign: Some("DAL45".into()),
            atc_station: "Rockford Ground".into(),
            atis: "C".into(),
            destination: Some("IPPH".into()),
            route: Some("GPS".into()),
            runway: "25R".into(),
            initial_altitude: Some(3000),
            flight_level: Some("FL80".into()),
            squawk: Some("4521".into()),
            ..ClearanceRequest::default()
        }
    }

    #[test]
    fn renders_default_template() {
        let rendered = render(
            &request(),
            &ClearanceFormat::default(),
            &Aviation::default(),
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();

        assert_eq!(
            rendered.clearance,
            "DAL45, Rockford Ground, good day. Startup approved. Information C is correct. \
             Cleared to IPPH via GPS, runway 25R. Initial climb 3000FT, expect further climb \
             to Flight Level 080. Squawk 4521."
        );
    }

    #[test]
    fn route_phrase_follows_routing_type() {
        let aviation = Aviation::default();
        let mut req = request();

        req.routing_type = RoutingType::Sid;
        req.sid = Some("CIV1K".into());
        assert_eq!(route_phrase(&req, &aviation).unwrap(), "the CIV1K departure");

        req.routing_type = RoutingType::Rdv;
        assert_eq!(route_phrase(&req, &aviation).unwrap(), "radar vectors");

        req.routing_type = RoutingType::Direct;
        req.waypoint = Some("BOBUX".into());
        assert_eq!(route_phrase(&req, &aviation).unwrap(), "direct BOBUX");

        req.routing_type = RoutingType::AsFiled;
        req.route = Some("  ".into());
        assert_eq!(route_phrase(&req, &aviation).unwrap(), "as filed");
    }

    #[test]
    fn validation_applies_only_when_enabled() {
        let mut req = request();
        req.runway = "runway two".into();
        req.routing_type = RoutingType::Sid;
        req.sid = Some("TOO-LONG-SID".into());

        let lenient = Aviation::default();
        assert!(render(&req, &ClearanceFormat::default(), &lenient, &mut rand::thread_rng()).is_ok());

        let strict = Aviation {
            enable_runway_validation: true,
            enable_sid_validation: true,
            ..Aviation::default()
        };
        assert_eq!(
            validate_runway(&req.runway, &strict),
            Err(ClearanceError::InvalidRunway("runway two".into()))
        );
        assert!(matches!(
            route_phrase(&req, &strict),
            Err(ClearanceError::InvalidSid(_))
        ));
        assert!(validate_runway("09l", &strict).is_ok());
    }

    #[test]
    fn unknown_routing_types_read_as_filed() {
        let parsed: RoutingType = serde_json::from_str("\"VECTORS\"").unwrap();
        assert_eq!(parsed, RoutingType::AsFiled);
        let sid: RoutingType = serde_json::from_str("\"SID\"").unwrap();
        assert_eq!(sid, RoutingType::Sid);
    }

    #[test]
    fn flight_levels_are_padded() {
        assert_eq!(normalize_flight_level("FL350"), "350");
        assert_eq!(normalize_flight_level("80"), "080");
        assert_eq!(normalize_flight_level("N/A"), "N/A");
    }

    #[test]
    fn squawks_stay_in_range_and_skip_exclusions() {
        let range = SquawkRange {
            min: 7470,
            max: 7710,
            exclude: vec![7500, 7600, 7700],
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = generate_squawk(&range, &mut rng).unwrap();
            let value: u16 = code.parse().unwrap();
            assert!((range.min..=range.max).contains(&value));
            assert!(!range.exclude.contains(&value));
            assert!(code.chars().all(|c| ('0'..='7').contains(&c)), "{code}");
        }
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let range = SquawkRange {
            min: 7700,
            max: 7700,
            exclude: vec![7700],
        };
        assert_eq!(
            generate_squawk(&range, &mut rand::thread_rng()),
            Err(ClearanceError::NoSquawkAvailable { min: 7700, max: 7700 })
        );
    }

    #[test]
    fn missing_station_is_rejected() {
        let req = ClearanceRequest {
            atc_station: " ".into(),
            ..request()
        };
        assert_eq!(
            render(&req, &ClearanceFormat::default(), &Aviation::default(), &mut rand::thread_rng()),
            Err(ClearanceError::Missing("ATC call sign"))
        );
    }
}
