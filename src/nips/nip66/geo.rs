use std::net::IpAddr;

use maxminddb::geoip2;
use serde::Serialize;
use serde_json::{Value, json};

use crate::nips::logs::ProbeLogs;

/// Geolocation of a relay's resolved IP, from a GeoLite2 City database.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Nip66GeoData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_postal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_continent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_continent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_accuracy: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_tz: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_geoname_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_is_eu: Option<bool>,
}

/// Geo probe result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip66GeoMetadata {
    pub data: Nip66GeoData,
    pub logs: ProbeLogs,
}

impl Nip66GeoMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }
}

/// Geohash precision used for NIP-66 `g` tags.
pub const GEOHASH_PRECISION: usize = 9;

const GEOHASH_BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Standard geohash encoding of a WGS84 coordinate.
pub fn geohash(lat: f64, lon: f64, precision: usize) -> String {
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0u8;
    let mut bit_count = 0u8;
    let mut even_bit = true;

    while hash.len() < precision {
        if even_bit {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if lon >= mid {
                bits = (bits << 1) | 1;
                lon_range.0 = mid;
            } else {
                bits <<= 1;
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                bits = (bits << 1) | 1;
                lat_range.0 = mid;
            } else {
                bits <<= 1;
                lat_range.1 = mid;
            }
        }
        even_bit = !even_bit;
        bit_count += 1;
        if bit_count == 5 {
            hash.push(GEOHASH_BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }
    hash
}

fn english_name(names: Option<&std::collections::BTreeMap<&str, &str>>) -> Option<String> {
    names?.get("en").map(|name| (*name).to_string())
}

/// Look up a resolved relay IP in the caller-supplied GeoLite2 City
/// reader. Clearnet only; the orchestrator skips this probe when no
/// reader or no resolved address is available.
pub fn run_geo(ip: IpAddr, reader: &maxminddb::Reader<Vec<u8>>) -> Nip66GeoMetadata {
    let city: geoip2::City = match reader.lookup(ip) {
        Ok(city) => city,
        Err(e) => {
            return Nip66GeoMetadata {
                data: Nip66GeoData::default(),
                logs: ProbeLogs::fail(format!("geo lookup failed for {ip}: {e}")),
            };
        }
    };

    let mut data = Nip66GeoData {
        geo_ip: Some(ip.to_string()),
        ..Nip66GeoData::default()
    };

    if let Some(country) = city.country.as_ref() {
        data.geo_country = country.iso_code.map(str::to_string);
        data.geo_country_name = english_name(country.names.as_ref());
        data.geo_is_eu = country.is_in_european_union;
    }
    if let Some(city_rec) = city.city.as_ref() {
        data.geo_city = english_name(city_rec.names.as_ref());
        data.geo_geoname_id = city_rec.geoname_id.map(i64::from);
    }
    if let Some(subdivisions) = city.subdivisions.as_ref() {
        data.geo_region = subdivisions
            .first()
            .and_then(|sub| english_name(sub.names.as_ref()));
    }
    if let Some(postal) = city.postal.as_ref() {
        data.geo_postal = postal.code.map(str::to_string);
    }
    if let Some(continent) = city.continent.as_ref() {
        data.geo_continent = continent.code.map(str::to_string);
        data.geo_continent_name = english_name(continent.names.as_ref());
    }
    if let Some(location) = city.location.as_ref() {
        data.geo_lat = location.latitude;
        data.geo_lon = location.longitude;
        data.geo_accuracy = location.accuracy_radius.map(i64::from);
        data.geo_tz = location.time_zone.map(str::to_string);
        if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
            data.geo_hash = Some(geohash(lat, lon, GEOHASH_PRECISION));
        }
    }

    Nip66GeoMetadata {
        data,
        logs: ProbeLogs::ok(),
    }
}
