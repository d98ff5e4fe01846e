use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted item name, in characters
pub const MAX_NAME_LEN: usize = 200;
/// Upper bound on a page size
pub const MAX_LIMIT: u32 = 100;

/// A stored item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
  pub id: i64,
  pub name: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Request body for create and update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
  pub name: String,
}

impl NewItem {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  /// Parse and validate a JSON request body.
  pub fn from_json(body: &[u8]) -> Result<Self, String> {
    let item: NewItem =
      serde_json::from_slice(body).map_err(|e| format!("Invalid item body: {}", e))?;
    item.validate()
  }

  /// Trim the name and check its length.
  pub fn validate(self) -> Result<Self, String> {
    let name = self.name.trim();
    if name.is_empty() {
      return Err("Item name must not be empty".to_string());
    }
    if name.chars().count() > MAX_NAME_LEN {
      return Err(format!(
        "Item name must be at most {} characters",
        MAX_NAME_LEN
      ));
    }
    Ok(Self::new(name))
  }
}

/// Filter and pagination for the item collection.
///
/// The default value is the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
  /// Substring filter, case-insensitive for ASCII letters only (as SQLite's
  /// `lower()`), stored folded
  pub name: Option<String>,
  pub limit: Option<u32>,
  pub offset: u32,
}

impl ListQuery {
  /// Parse a URL query string such as `name=foo&limit=10&offset=20`.
  ///
  /// Unknown parameters are ignored and the last occurrence of a repeated
  /// parameter wins. `limit` is clamped to `1..=100`.
  pub fn parse(query: &str) -> Result<Self, String> {
    let mut parsed = Self::default();
    for (param, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
      match param.as_ref() {
        "name" => {
          let name = value.trim().to_ascii_lowercase();
          parsed.name = (!name.is_empty()).then_some(name);
        }
        "limit" => {
          let limit: u32 = value
            .trim()
            .parse()
            .map_err(|_| format!("Invalid limit: {}", value))?;
          parsed.limit = Some(limit.clamp(1, MAX_LIMIT));
        }
        "offset" => {
          parsed.offset = value
            .trim()
            .parse()
            .map_err(|_| format!("Invalid offset: {}", value))?;
        }
        _ => {}
      }
    }
    Ok(parsed)
  }

  /// True for the unfiltered, unpaginated collection read
  pub fn is_all(&self) -> bool {
    self.name.is_none() && self.limit.is_none() && self.offset == 0
  }

  /// Stable rendering used for fingerprinting.
  pub fn canonical(&self) -> String {
    format!(
      "name={}&limit={}&offset={}",
      self.name.as_deref().unwrap_or(""),
      self.limit.map(|l| l.to_string()).unwrap_or_default(),
      self.offset
    )
  }

  /// Whether `item` passes the name filter
  pub fn matches(&self, item: &Item) -> bool {
    match &self.name {
      Some(needle) => item.name.to_ascii_lowercase().contains(needle.as_str()),
      None => true,
    }
  }
}
