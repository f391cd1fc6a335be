//! Core domain model for afflink: item records, the agent set, and the flat
//! table row they are reshaped into for upload.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const LINK_FIELD: &str = "link";
pub const RAWLINK_FIELD: &str = "rawlink";
pub const CATEGORY_FIELD: &str = "category";
pub const DEFAULT_SCHEME: &str = "https://";

/// Reseller services an affiliate link variant is generated for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    #[default]
    Kakobuy,
    Superbuy,
    Basetao,
    Mulebuy,
    Joyagoo,
    Cnfans,
    Acbuy,
    Eastmallbuy,
    Orientdig,
    Sifubuy,
    Loongbuy,
    Itaobuy,
    Lovegobuy,
    Oopbuy,
}

impl Agent {
    pub const ALL: [Agent; 14] = [
        Agent::Kakobuy,
        Agent::Superbuy,
        Agent::Basetao,
        Agent::Mulebuy,
        Agent::Joyagoo,
        Agent::Cnfans,
        Agent::Acbuy,
        Agent::Eastmallbuy,
        Agent::Orientdig,
        Agent::Sifubuy,
        Agent::Loongbuy,
        Agent::Itaobuy,
        Agent::Lovegobuy,
        Agent::Oopbuy,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Agent::Kakobuy => "kakobuy",
            Agent::Superbuy => "superbuy",
            Agent::Basetao => "basetao",
            Agent::Mulebuy => "mulebuy",
            Agent::Joyagoo => "joyagoo",
            Agent::Cnfans => "cnfans",
            Agent::Acbuy => "acbuy",
            Agent::Eastmallbuy => "eastmallbuy",
            Agent::Orientdig => "orientdig",
            Agent::Sifubuy => "sifubuy",
            Agent::Loongbuy => "loongbuy",
            Agent::Itaobuy => "itaobuy",
            Agent::Lovegobuy => "lovegobuy",
            Agent::Oopbuy => "oopbuy",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agent `{0}`")]
pub struct UnknownAgent(pub String);

impl FromStr for Agent {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Agent::ALL
            .into_iter()
            .find(|agent| agent.as_str() == needle)
            .ok_or_else(|| UnknownAgent(s.to_string()))
    }
}

/// Appends the referral tag as a trailing path segment.
pub fn tag_affiliate_url(url: &str, referral_tag: &str) -> String {
    format!("{url}/{referral_tag}")
}

pub fn has_scheme(link: &str) -> bool {
    let lower = link.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Returns the link with the default scheme prepended, or `None` when it
/// already carries one.
pub fn ensure_scheme(link: &str) -> Option<String> {
    if has_scheme(link) {
        None
    } else {
        Some(format!("{DEFAULT_SCHEME}{link}"))
    }
}

/// One product record as it travels through the hand-off files.
///
/// Stored as the raw JSON object so fields this crate does not know about
/// survive every stage in their original order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemRecord(Map<String, JsonValue>);

impl ItemRecord {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn link(&self) -> Option<&str> {
        self.str_field(LINK_FIELD)
    }

    pub fn rawlink(&self) -> Option<&str> {
        self.str_field(RAWLINK_FIELD)
    }

    /// Copies `link` into `rawlink` unless a `rawlink` is already present.
    /// Returns whether anything was written.
    pub fn preserve_rawlink(&mut self) -> bool {
        if self.0.contains_key(RAWLINK_FIELD) {
            return false;
        }
        match self.link().map(str::to_owned) {
            Some(link) => {
                self.0.insert(RAWLINK_FIELD.to_string(), JsonValue::String(link));
                true
            }
            None => false,
        }
    }

    pub fn agent_link(&self, agent: Agent) -> Option<&str> {
        self.str_field(agent.as_str())
    }

    pub fn set_agent_link(&mut self, agent: Agent, url: String) {
        self.0.insert(agent.as_str().to_string(), JsonValue::String(url));
    }

    pub fn agent_links(&self) -> impl Iterator<Item = (Agent, &str)> + '_ {
        Agent::ALL
            .into_iter()
            .filter_map(move |agent| self.agent_link(agent).map(|url| (agent, url)))
    }

    /// Category entries in order, or `None` when the field is absent or not a list.
    pub fn categories(&self) -> Option<Vec<String>> {
        self.0
            .get(CATEGORY_FIELD)
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(|v| scalar_text(Some(v))).collect())
    }

    /// Prepends the default scheme to `link` when it has none.
    pub fn normalize_link(&mut self) -> bool {
        let Some(fixed) = self.link().and_then(ensure_scheme) else {
            return false;
        };
        self.0.insert(LINK_FIELD.to_string(), JsonValue::String(fixed));
        true
    }
}

impl From<Map<String, JsonValue>> for ItemRecord {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }
}

fn scalar_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn numeric(value: Option<&JsonValue>) -> f64 {
    let parsed: Option<f64> = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Flattened row matching the remote table's column layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableRow {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub image: String,
    pub link: String,
    pub rawlink: String,
    pub brand: String,
    pub batch: String,
    pub agents: BTreeMap<Agent, String>,
    pub categories: Vec<String>,
}

impl TableRow {
    pub fn category_column(index: usize) -> String {
        format!("category[{index}]")
    }
}

impl From<&ItemRecord> for TableRow {
    fn from(item: &ItemRecord) -> Self {
        let link = scalar_text(item.get(LINK_FIELD));
        let rawlink = match item.get(RAWLINK_FIELD) {
            Some(value) => scalar_text(Some(value)),
            None => link.clone(),
        };
        Self {
            id: scalar_text(item.get("id")),
            name: scalar_text(item.get("name")),
            price: numeric(item.get("price")),
            image: scalar_text(item.get("image")),
            link,
            rawlink,
            brand: scalar_text(item.get("brand")),
            batch: scalar_text(item.get("batch")),
            agents: item
                .agent_links()
                .map(|(agent, url)| (agent, url.to_string()))
                .collect(),
            categories: item.categories().unwrap_or_default(),
        }
    }
}

impl Serialize for TableRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 8 + self.agents.len() + self.categories.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("_id", &self.id)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("price", &self.price)?;
        map.serialize_entry("image", &self.image)?;
        map.serialize_entry("link", &self.link)?;
        map.serialize_entry("rawlink", &self.rawlink)?;
        map.serialize_entry("brand", &self.brand)?;
        map.serialize_entry("batch", &self.batch)?;
        for (agent, url) in &self.agents {
            map.serialize_entry(agent.as_str(), url)?;
        }
        for (index, category) in self.categories.iter().enumerate() {
            map.serialize_entry(&Self::category_column(index), category)?;
        }
        map.end()
    }
}
