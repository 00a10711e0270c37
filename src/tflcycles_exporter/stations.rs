// tflcycles_exporter - Prometheus metrics exporter for TfL Santander Cycles
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::error;
use std::fmt;
use std::num::ParseIntError;

static WHITESPACE_BEFORE_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\t\n\x0C\r ]+,").expect("invalid whitespace pattern"));

/// Relatively stable metadata about a docking point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Station {
    /// Human-readable location, e.g. "Stonecutter Street, Holborn", from `commonName`.
    pub name: String,
    /// Total number of docks, including those out of service, from `NbDocks`.
    pub docks: u32,
}

/// Hire and drop-off services available at a station. Every count is of
/// in-service resources available to use right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    /// Vacant docks a bike can be returned to, from `NbEmptyDocks`.
    pub docks: u32,
    /// Conventional bikes available for hire, from `NbStandardBikes`.
    pub bicycles: u32,
    /// Electric bikes available for hire, from `NbEBikes`.
    pub ebikes: u32,
}

/// A single snapshot row: one station and its current availability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationAvailability {
    pub station: Station,
    pub availability: Availability,
}

/// Feed property that populates a field of a `StationAvailability`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Docks,
    EmptyDocks,
    StandardBikes,
    EBikes,
}

impl Property {
    /// Find the property for a key in `additionalProperties`, `None` if we don't use it.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "NbDocks" => Some(Self::Docks),
            "NbEmptyDocks" => Some(Self::EmptyDocks),
            "NbStandardBikes" => Some(Self::StandardBikes),
            "NbEBikes" => Some(Self::EBikes),
            _ => None,
        }
    }

    pub fn apply(self, sa: &mut StationAvailability, value: u32) {
        match self {
            Self::Docks => sa.station.docks = value,
            Self::EmptyDocks => sa.availability.docks = value,
            Self::StandardBikes => sa.availability.bicycles = value,
            Self::EBikes => sa.availability.ebikes = value,
        }
    }
}

/// Remove whitespace before commas in bike point names.
///
/// Dozens of stations have a single space before the comma and at least one
/// has two (`"Kennington Road  , Vauxhall"`).
pub fn normalize_name(name: &str) -> String {
    WHITESPACE_BEFORE_COMMA.replace_all(name, ",").into_owned()
}

#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    Property {
        key: String,
        value: String,
        source: ParseIntError,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed payload: {}", e),
            Self::Property { key, value, source } => {
                write!(f, "invalid value {:?} for property {}: {}", value, key, source)
            }
        }
    }
}

impl error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Property { source, .. } => Some(source),
        }
    }
}

#[derive(Deserialize, Debug)]
struct Place {
    #[serde(alias = "commonName", default)]
    common_name: String,
    #[serde(alias = "additionalProperties", default)]
    additional_properties: Vec<AdditionalProperty>,
}

// `modified` is not interpreted: the API can miss a bike being rented and
// returned within the same interval and not update the timestamp.
#[derive(Deserialize, Debug)]
struct AdditionalProperty {
    #[serde(alias = "key")]
    key: String,
    #[serde(alias = "value")]
    value: String,
}

/// Decode a `/BikePoint` response body into one record per place, in the same
/// order as the payload (sorted by station ID upstream).
///
/// Any error means the whole payload is rejected, there is no partial result.
pub fn decode(body: &[u8]) -> Result<Vec<StationAvailability>, DecodeError> {
    let places: Vec<Place> = serde_json::from_slice(body).map_err(DecodeError::Json)?;
    places.into_iter().map(to_station_availability).collect()
}

fn to_station_availability(place: Place) -> Result<StationAvailability, DecodeError> {
    let mut sa = StationAvailability::default();
    sa.station.name = normalize_name(&place.common_name);

    for prop in place.additional_properties {
        let Some(property) = Property::from_key(&prop.key) else {
            continue;
        };

        let value = prop.value.parse::<u32>().map_err(|e| DecodeError::Property {
            key: prop.key.clone(),
            value: prop.value.clone(),
            source: e,
        })?;
        property.apply(&mut sa, value);
    }

    Ok(sa)
}
