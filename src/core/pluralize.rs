//! Collection naming
//!
//! Model class names become collection names and URL segments: a trailing `Service`,
//! `Controller` or `Resource` is stripped, the rest is lowercased and pluralised.

/// Utility deriving collection names from model class names
pub struct Pluralizer;

const STRIPPED_SUFFIXES: &[&str] = &["Service", "Controller", "Resource"];

impl Pluralizer {
    /// Convert a singular noun to its plural form
    ///
    /// # Examples
    ///
    /// ```
    /// use appkernel::core::pluralize::Pluralizer;
    ///
    /// assert_eq!(Pluralizer::pluralize("user"), "users");
    /// assert_eq!(Pluralizer::pluralize("company"), "companies");
    /// assert_eq!(Pluralizer::pluralize("address"), "addresses");
    /// ```
    pub fn pluralize(singular: &str) -> String {
        if singular.is_empty() {
            return singular.to_string();
        }

        match singular {
            // consonant + y -> ies
            s if s.len() > 1
                && s.ends_with('y')
                && !matches!(
                    s.chars().nth_back(1),
                    Some('a' | 'e' | 'i' | 'o' | 'u')
                ) =>
            {
                format!("{}ies", &s[..s.len() - 1])
            }

            s if s.ends_with('s')
                || s.ends_with("sh")
                || s.ends_with("ch")
                || s.ends_with('x')
                || s.ends_with('z') =>
            {
                format!("{}es", s)
            }

            s => format!("{}s", s),
        }
    }

    /// Collection name for a model class name
    ///
    /// ```
    /// use appkernel::core::pluralize::Pluralizer;
    ///
    /// assert_eq!(Pluralizer::collection_name("User"), "users");
    /// assert_eq!(Pluralizer::collection_name("StockItem"), "stockitems");
    /// assert_eq!(Pluralizer::collection_name("ReservationService"), "reservations");
    /// ```
    pub fn collection_name(class_name: &str) -> String {
        let base = STRIPPED_SUFFIXES
            .iter()
            .find_map(|suffix| {
                class_name
                    .strip_suffix(suffix)
                    .filter(|rest| !rest.is_empty())
            })
            .unwrap_or(class_name);
        Self::pluralize(&base.to_lowercase())
    }
}
