use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::nips::parsing::{take_bool, take_int, take_int_list, take_str, take_str_list};

/// Server-imposed limitations advertised in a NIP-11 document.
///
/// Every field is optional; relays may omit any or all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Nip11Limitation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_event_tags: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_pow_difficulty: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restricted_writes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_lower_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_upper_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_limit: Option<i64>,
}

impl Nip11Limitation {
    pub fn parse(data: &Value) -> Self {
        Self {
            max_message_length: take_int(data, "max_message_length"),
            max_subscriptions: take_int(data, "max_subscriptions"),
            max_limit: take_int(data, "max_limit"),
            max_subid_length: take_int(data, "max_subid_length"),
            max_event_tags: take_int(data, "max_event_tags"),
            max_content_length: take_int(data, "max_content_length"),
            min_pow_difficulty: take_int(data, "min_pow_difficulty"),
            auth_required: take_bool(data, "auth_required"),
            payment_required: take_bool(data, "payment_required"),
            restricted_writes: take_bool(data, "restricted_writes"),
            created_at_lower_limit: take_int(data, "created_at_lower_limit"),
            created_at_upper_limit: take_int(data, "created_at_upper_limit"),
            default_limit: take_int(data, "default_limit"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A `kinds` entry in a retention policy: a single kind or an inclusive
/// `[start, end]` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionKinds {
    Single(i64),
    Range(i64, i64),
}

impl RetentionKinds {
    fn parse(value: &Value) -> Option<Self> {
        if let Some(kind) = value.as_i64() {
            return Some(RetentionKinds::Single(kind));
        }
        let pair = value.as_array()?;
        if pair.len() != 2 {
            return None;
        }
        Some(RetentionKinds::Range(pair[0].as_i64()?, pair[1].as_i64()?))
    }

    fn to_json(&self) -> Value {
        match self {
            RetentionKinds::Single(kind) => json!(kind),
            RetentionKinds::Range(lo, hi) => json!([lo, hi]),
        }
    }
}

/// Single retention policy entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nip11RetentionEntry {
    pub kinds: Option<Vec<RetentionKinds>>,
    pub time: Option<i64>,
    pub count: Option<i64>,
}

impl Nip11RetentionEntry {
    pub fn parse(data: &Value) -> Self {
        let kinds = data.get("kinds").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(RetentionKinds::parse)
                .collect::<Vec<_>>()
        });
        Self {
            kinds: kinds.filter(|k| !k.is_empty()),
            time: take_int(data, "time"),
            count: take_int(data, "count"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_none() && self.time.is_none() && self.count.is_none()
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(ref kinds) = self.kinds {
            map.insert(
                "kinds".to_string(),
                Value::Array(kinds.iter().map(RetentionKinds::to_json).collect()),
            );
        }
        if let Some(time) = self.time {
            map.insert("time".to_string(), json!(time));
        }
        if let Some(count) = self.count {
            map.insert("count".to_string(), json!(count));
        }
        Value::Object(map)
    }
}

/// Single fee entry (admission, subscription, or publication).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Nip11FeeEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<i64>>,
}

impl Nip11FeeEntry {
    fn parse(data: &Value) -> Self {
        Self {
            amount: take_int(data, "amount"),
            unit: take_str(data, "unit"),
            period: take_int(data, "period"),
            kinds: take_int_list(data, "kinds"),
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Fee schedule categories from a NIP-11 document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Nip11Fees {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission: Option<Vec<Nip11FeeEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Vec<Nip11FeeEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<Vec<Nip11FeeEntry>>,
}

impl Nip11Fees {
    pub fn parse(data: &Value) -> Self {
        let parse_list = |key: &str| -> Option<Vec<Nip11FeeEntry>> {
            let entries: Vec<Nip11FeeEntry> = data
                .get(key)?
                .as_array()?
                .iter()
                .map(Nip11FeeEntry::parse)
                .filter(|e| !e.is_empty())
                .collect();
            (!entries.is_empty()).then_some(entries)
        };
        Self {
            admission: parse_list("admission"),
            subscription: parse_list("subscription"),
            publication: parse_list("publication"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.admission.is_none() && self.subscription.is_none() && self.publication.is_none()
    }
}

/// Parsed NIP-11 relay information document.
///
/// Parsing is permissive: every field is accepted only when it matches
/// its declared type and silently dropped otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip11Info {
    pub name: Option<String>,
    pub description: Option<String>,
    pub banner: Option<String>,
    pub icon: Option<String>,
    pub pubkey: Option<String>,
    /// The relay's own pubkey from the NIP-11 `self` field.
    pub self_pubkey: Option<String>,
    pub contact: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub privacy_policy: Option<String>,
    pub terms_of_service: Option<String>,
    pub posting_policy: Option<String>,
    pub payments_url: Option<String>,
    pub supported_nips: Option<Vec<i64>>,
    pub relay_countries: Option<Vec<String>>,
    pub language_tags: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub limitation: Nip11Limitation,
    pub retention: Option<Vec<Nip11RetentionEntry>>,
    pub fees: Nip11Fees,
}

impl Nip11Info {
    pub fn parse(data: &Value) -> Self {
        if !data.is_object() {
            return Self::default();
        }

        let retention = data.get("retention").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .map(Nip11RetentionEntry::parse)
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>()
        });

        Self {
            name: take_str(data, "name"),
            description: take_str(data, "description"),
            banner: take_str(data, "banner"),
            icon: take_str(data, "icon"),
            pubkey: take_str(data, "pubkey"),
            self_pubkey: take_str(data, "self"),
            contact: take_str(data, "contact"),
            software: take_str(data, "software"),
            version: take_str(data, "version"),
            privacy_policy: take_str(data, "privacy_policy"),
            terms_of_service: take_str(data, "terms_of_service"),
            posting_policy: take_str(data, "posting_policy"),
            payments_url: take_str(data, "payments_url"),
            supported_nips: take_int_list(data, "supported_nips"),
            relay_countries: take_str_list(data, "relay_countries"),
            language_tags: take_str_list(data, "language_tags"),
            tags: take_str_list(data, "tags"),
            limitation: data
                .get("limitation")
                .map(Nip11Limitation::parse)
                .unwrap_or_default(),
            retention: retention.filter(|r| !r.is_empty()),
            fees: data.get("fees").map(Nip11Fees::parse).unwrap_or_default(),
        }
    }

    /// Serialize for metadata storage, omitting empty fields. The
    /// `self_pubkey` field serializes under its wire name `self`.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        let mut put_str = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                map.insert(key.to_string(), json!(v));
            }
        };
        put_str("name", &self.name);
        put_str("description", &self.description);
        put_str("banner", &self.banner);
        put_str("icon", &self.icon);
        put_str("pubkey", &self.pubkey);
        put_str("self", &self.self_pubkey);
        put_str("contact", &self.contact);
        put_str("software", &self.software);
        put_str("version", &self.version);
        put_str("privacy_policy", &self.privacy_policy);
        put_str("terms_of_service", &self.terms_of_service);
        put_str("posting_policy", &self.posting_policy);
        put_str("payments_url", &self.payments_url);

        if let Some(ref nips) = self.supported_nips {
            map.insert("supported_nips".to_string(), json!(nips));
        }
        if let Some(ref countries) = self.relay_countries {
            map.insert("relay_countries".to_string(), json!(countries));
        }
        if let Some(ref langs) = self.language_tags {
            map.insert("language_tags".to_string(), json!(langs));
        }
        if let Some(ref tags) = self.tags {
            map.insert("tags".to_string(), json!(tags));
        }
        if !self.limitation.is_empty() {
            map.insert(
                "limitation".to_string(),
                serde_json::to_value(&self.limitation).unwrap_or_default(),
            );
        }
        if let Some(ref retention) = self.retention {
            map.insert(
                "retention".to_string(),
                Value::Array(retention.iter().map(Nip11RetentionEntry::to_json).collect()),
            );
        }
        if !self.fees.is_empty() {
            map.insert(
                "fees".to_string(),
                serde_json::to_value(&self.fees).unwrap_or_default(),
            );
        }
        Value::Object(map)
    }
}
