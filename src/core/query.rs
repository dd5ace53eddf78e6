//! Query-string grammar, sorting and pagination
//!
//! Flat URL parameters become a store filter document:
//!
//! ```text
//! GET /users/?name=~jo                       {"name": {"$regex": ".*jo.*", "$options": "i"}}
//! GET /users/?age=>18&age=<65                {"age": {"$gte": 18, "$lt": 65}}
//! GET /users/?name=[Jane,John]               {"name": {"$in": ["Jane", "John"]}}
//! GET /users/?roles=#2                       {"roles": {"$size": 2}}
//! GET /users/?name=Jane&locked=!true&logic=or {"$or": [{"name": "Jane"}, {"locked": {"$ne": true}}]}
//! GET /users/?page=2&page_size=10&sort_by=name&sort_order=DESC
//! ```

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::core::error::{ChassisResult, RequestError};
use crate::core::expr::{SortDirection, SortSpec};
use crate::core::model::Document;
use crate::core::temporal;

/// Parameters that steer the listing and never become filter keys
pub const RESERVED_PARAMS: &[&str] = &["page", "page_size", "sort_by", "sort_order", "logic", "query"];

/// Page size limits
#[derive(Debug, Clone, Copy)]
pub struct PageSettings {
    pub default_size: u64,
    pub max_size: u64,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            default_size: 50,
            max_size: 100,
        }
    }
}

/// Resolved page; `page` is 0-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
}

impl Pagination {
    pub fn skip(&self) -> u64 {
        self.page.saturating_mul(self.page_size)
    }
}

/// Multi-valued query parameters in arrival order
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse a raw query string; `+` decodes to a space
    pub fn from_query_string(raw: &str) -> Self {
        let pairs = raw
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (key, value) = part.split_once('=').unwrap_or((part, ""));
                (decode(key), decode(value))
            })
            .collect();
        Self { pairs }
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// First value of a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Resolve `page` (1-based) and `page_size` against the limits
    pub fn pagination(&self, settings: PageSettings) -> ChassisResult<Pagination> {
        let page = match self.get("page") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(page) if page >= 1 => page - 1,
                _ => {
                    return Err(RequestError::InvalidParameter {
                        name: "page".to_string(),
                        message: "expected a positive integer".to_string(),
                    }
                    .into());
                }
            },
            None => 0,
        };
        let page_size = match self.get("page_size") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(size) if size >= 1 => size.min(settings.max_size),
                _ => {
                    return Err(RequestError::InvalidParameter {
                        name: "page_size".to_string(),
                        message: "expected a positive integer".to_string(),
                    }
                    .into());
                }
            },
            None => settings.default_size.min(settings.max_size),
        };
        // Stores take signed 64-bit offsets
        if page
            .checked_mul(page_size)
            .is_none_or(|skip| skip > i64::MAX as u64)
        {
            return Err(RequestError::InvalidParameter {
                name: "page".to_string(),
                message: format!("page {} is out of range", page + 1),
            }
            .into());
        }
        Ok(Pagination { page, page_size })
    }

    /// Sort order from `sort_by` (comma separated) and `sort_order` (ASC|DESC)
    pub fn sort(&self) -> ChassisResult<Vec<SortSpec>> {
        let direction = match self.get("sort_order").map(|s| s.trim().to_uppercase()) {
            None => SortDirection::Asc,
            Some(order) if order == "ASC" => SortDirection::Asc,
            Some(order) if order == "DESC" => SortDirection::Desc,
            Some(_) => {
                return Err(RequestError::InvalidParameter {
                    name: "sort_order".to_string(),
                    message: "expected ASC or DESC".to_string(),
                }
                .into());
            }
        };
        Ok(self
            .get("sort_by")
            .map(|fields| {
                fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(|f| SortSpec::new(f, direction))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Build the filter document from every non-reserved parameter
    ///
    /// Names in `excluded` are left out; they are handler arguments.
    pub fn filter(&self, excluded: &[&str]) -> ChassisResult<Document> {
        let mut grouped: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for (key, value) in &self.pairs {
            if RESERVED_PARAMS.contains(&key.as_str()) || excluded.contains(&key.as_str()) {
                continue;
            }
            grouped.entry(key.as_str()).or_default().push(value.as_str());
        }

        let clauses: Vec<Document> = grouped
            .into_iter()
            .map(|(key, values)| key_clause(key, &values))
            .collect();

        let any = self
            .get("logic")
            .is_some_and(|logic| logic.trim().eq_ignore_ascii_case("or"));
        let mut filter = if any && clauses.len() > 1 {
            let mut doc = Document::new();
            doc.insert(
                "$or".to_string(),
                Value::Array(clauses.into_iter().map(Value::Object).collect()),
            );
            doc
        } else if distinct_keys(&clauses) {
            clauses.into_iter().flatten().collect()
        } else {
            let mut doc = Document::new();
            doc.insert(
                "$and".to_string(),
                Value::Array(clauses.into_iter().map(Value::Object).collect()),
            );
            doc
        };

        if let Some(raw) = self.get("query") {
            let raw_filter = match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    return Err(RequestError::InvalidParameter {
                        name: "query".to_string(),
                        message: "expected a JSON object".to_string(),
                    }
                    .into());
                }
            };
            filter = if filter.is_empty() {
                raw_filter
            } else {
                let mut doc = Document::new();
                doc.insert(
                    "$and".to_string(),
                    json!([Value::Object(filter), Value::Object(raw_filter)]),
                );
                doc
            };
        }
        Ok(filter)
    }
}

fn distinct_keys(clauses: &[Document]) -> bool {
    let mut seen = HashSet::new();
    clauses
        .iter()
        .flat_map(|clause| clause.keys())
        .all(|key| seen.insert(key.as_str()))
}

fn decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .unwrap_or(spaced)
}

/// One parsed `k=<op><value>` leaf
enum Leaf {
    Equal(Value),
    Operator(&'static str, Value),
}

fn parse_leaf(raw: &str) -> Leaf {
    if let Some(rest) = raw.strip_prefix('>') {
        Leaf::Operator("$gte", coerce(rest))
    } else if let Some(rest) = raw.strip_prefix('<') {
        Leaf::Operator("$lt", coerce(rest))
    } else if let Some(rest) = raw.strip_prefix('!') {
        Leaf::Operator("$ne", coerce(rest))
    } else if let Some(rest) = raw.strip_prefix('~') {
        Leaf::Operator("$regex", json!(format!(".*{}.*", regex::escape(rest))))
    } else if let Some(rest) = raw.strip_prefix('#') {
        Leaf::Operator("$size", coerce(rest))
    } else if raw.len() >= 2 && raw.starts_with('[') && raw.ends_with(']') {
        let items = raw[1..raw.len() - 1]
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(coerce)
            .collect();
        Leaf::Operator("$in", Value::Array(items))
    } else {
        Leaf::Equal(coerce(raw))
    }
}

fn key_clause(key: &str, values: &[&str]) -> Document {
    let leaves: Vec<Leaf> = values.iter().map(|v| parse_leaf(v)).collect();

    if let [Leaf::Equal(value)] = leaves.as_slice() {
        let mut doc = Document::new();
        doc.insert(key.to_string(), value.clone());
        return doc;
    }

    // Repetitions merge into one operator map; a repeated operator splits into $and
    let mut maps: Vec<Document> = vec![Document::new()];
    for leaf in leaves {
        let (op, value) = match leaf {
            Leaf::Equal(value) => ("$eq", value),
            Leaf::Operator(op, value) => (op, value),
        };
        let slot = match maps.iter().position(|m| !m.contains_key(op)) {
            Some(slot) => slot,
            None => {
                maps.push(Document::new());
                maps.len() - 1
            }
        };
        let target = &mut maps[slot];
        target.insert(op.to_string(), value);
        if op == "$regex" {
            target.insert("$options".to_string(), json!("i"));
        }
    }

    let mut doc = Document::new();
    if maps.len() == 1 {
        doc.insert(key.to_string(), Value::Object(maps.remove(0)));
    } else {
        doc.insert(
            "$and".to_string(),
            Value::Array(
                maps.into_iter()
                    .map(|m| {
                        let mut clause = Document::new();
                        clause.insert(key.to_string(), Value::Object(m));
                        Value::Object(clause)
                    })
                    .collect(),
            ),
        );
    }
    doc
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^-?\d+$").unwrap())
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4}[-./]\d{1,2}[-./]\d{1,2}|\d{1,2}[-./]\d{1,2}[-./]\d{4})$").unwrap()
    })
}

/// Coerce a scalar leaf: integers, boolean literals, dates, else the string itself
pub fn coerce(raw: &str) -> Value {
    let s = raw.trim();
    if integer_pattern().is_match(s)
        && let Ok(i) = s.parse::<i64>()
    {
        return json!(i);
    }
    match s.to_lowercase().as_str() {
        "true" | "yes" | "y" => return json!(true),
        "false" | "no" => return json!(false),
        _ => {}
    }
    if date_pattern().is_match(s)
        && let Some(ts) = temporal::parse_datetime(s)
    {
        return temporal::store_date(&ts);
    }
    json!(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ChassisError;

    fn filter(raw: &str) -> Value {
        Value::Object(QueryParams::from_query_string(raw).filter(&[]).unwrap())
    }

    #[test]
    fn test_equality_and_coercion() {
        assert_eq!(filter("name=Jane"), json!({"name": "Jane"}));
        assert_eq!(filter("age=42"), json!({"age": 42}));
        assert_eq!(filter("locked=yes"), json!({"locked": true}));
        assert_eq!(filter("locked=false"), json!({"locked": false}));
        assert_eq!(
            filter("birth_date=1980-06-30"),
            json!({"birth_date": {"$date": "1980-06-30T00:00:00Z"}})
        );
        assert_eq!(
            filter("birth_date=30.06.1980"),
            json!({"birth_date": {"$date": "1980-06-30T00:00:00Z"}})
        );
    }

    #[test]
    fn test_range_on_one_key_merges() {
        assert_eq!(
            filter("age=>18&age=<65&logic=and"),
            json!({"age": {"$gte": 18, "$lt": 65}})
        );
        assert_eq!(
            filter("birth_date=>1980-06-30&birth_date=<1985-08-01&logic=AND"),
            json!({"birth_date": {
                "$gte": {"$date": "1980-06-30T00:00:00Z"},
                "$lt": {"$date": "1985-08-01T00:00:00Z"}
            }})
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(filter("name=!Max"), json!({"name": {"$ne": "Max"}}));
        assert_eq!(
            filter("name=~jo"),
            json!({"name": {"$regex": ".*jo.*", "$options": "i"}})
        );
        assert_eq!(filter("roles=%232"), json!({"roles": {"$size": 2}}));
        assert_eq!(
            filter("name=[Jane,John]"),
            json!({"name": {"$in": ["Jane", "John"]}})
        );
    }

    #[test]
    fn test_repeated_operator_uses_and() {
        assert_eq!(
            filter("name=!a&name=!b"),
            json!({"$and": [{"name": {"$ne": "a"}}, {"name": {"$ne": "b"}}]})
        );
    }

    #[test]
    fn test_logic_or_across_keys() {
        assert_eq!(
            filter("name=Jane&age=42&logic=or"),
            json!({"$or": [{"name": "Jane"}, {"age": 42}]})
        );
        assert_eq!(
            filter("name=Jane&age=42"),
            json!({"name": "Jane", "age": 42})
        );
    }

    #[test]
    fn test_reserved_and_excluded_params() {
        let params = QueryParams::from_query_string("name=Jane&page=2&page_size=5&sort_by=name&amount=3");
        let doc = params.filter(&["amount"]).unwrap();
        assert_eq!(Value::Object(doc), json!({"name": "Jane"}));
    }

    #[test]
    fn test_raw_query_param() {
        let raw = format!("query={}", urlencoding::encode(r#"{"name": {"$in": ["a"]}}"#));
        assert_eq!(filter(&raw), json!({"name": {"$in": ["a"]}}));
        let err = QueryParams::from_query_string("query=[1]").filter(&[]).unwrap_err();
        assert!(matches!(err, ChassisError::Request(_)));
    }

    #[test]
    fn test_plus_decodes_to_space() {
        assert_eq!(filter("name=Jane+Doe"), json!({"name": "Jane Doe"}));
    }

    #[test]
    fn test_pagination() {
        let settings = PageSettings::default();
        let p = QueryParams::from_query_string("").pagination(settings).unwrap();
        assert_eq!(p, Pagination { page: 0, page_size: 50 });

        let p = QueryParams::from_query_string("page=3&page_size=500")
            .pagination(settings)
            .unwrap();
        assert_eq!(p, Pagination { page: 2, page_size: 100 });
        assert_eq!(p.skip(), 200);

        assert!(
            QueryParams::from_query_string("page=0")
                .pagination(settings)
                .is_err()
        );
    }

    #[test]
    fn test_pagination_rejects_out_of_range_pages() {
        let settings = PageSettings::default();
        let err = QueryParams::from_query_string("page=18446744073709551615")
            .pagination(settings)
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let huge = Pagination {
            page: u64::MAX,
            page_size: 2,
        };
        assert_eq!(huge.skip(), u64::MAX);
    }

    #[test]
    fn test_sort() {
        let sort = QueryParams::from_query_string("sort_by=name,age&sort_order=desc")
            .sort()
            .unwrap();
        assert_eq!(sort.len(), 2);
        assert_eq!(sort[0].direction, SortDirection::Desc);
        assert!(
            QueryParams::from_query_string("sort_by=name&sort_order=sideways")
                .sort()
                .is_err()
        );
    }
}
