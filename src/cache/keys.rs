//! Cache key scheme.
//!
//! - items: `<resource>:<id>`
//! - listings: `<resources>:<page>:<page_size>[:<filter>]`
//! - search results: `search:<query>`
//!
//! Item and listing keys use distinct singular and plural namespaces, so an
//! item key can never fall under a listing prefix.

/// Default page for listings.
pub const DEFAULT_PAGE: u32 = 1;
/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Prefix shared by every cached search result.
pub const SEARCH_PREFIX: &str = "search:";

/// A cached resource type with its item and listing namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub singular: &'static str,
    pub plural: &'static str,
}

impl ResourceKind {
    pub const POST: ResourceKind = ResourceKind::new("post", "posts");

    pub const fn new(singular: &'static str, plural: &'static str) -> Self {
        Self { singular, plural }
    }
}

/// Pagination and filter parameters of a listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub page: u32,
    pub page_size: u32,
    pub filter: Option<String>,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE, DEFAULT_PAGE_SIZE)
    }
}

impl ListingQuery {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = (!filter.is_empty()).then_some(filter);
        self
    }

    /// Parse raw request parameters. Absent, unparsable or zero values fall
    /// back to page 1 and page size 10.
    pub fn from_params(page: Option<&str>, limit: Option<&str>) -> Self {
        Self::new(
            parse_positive(page).unwrap_or(DEFAULT_PAGE),
            parse_positive(limit).unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }

    /// Zero-based offset of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.page_size as usize)
    }
}

fn parse_positive(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|n| *n > 0)
}

pub fn item_key(kind: &ResourceKind, id: &str) -> String {
    format!("{}:{}", kind.singular, id)
}

pub fn listing_key(kind: &ResourceKind, query: &ListingQuery) -> String {
    match &query.filter {
        Some(filter) => format!("{}:{}:{}:{}", kind.plural, query.page, query.page_size, filter),
        None => format!("{}:{}:{}", kind.plural, query.page, query.page_size),
    }
}

/// Prefix covering every listing of `kind`.
pub fn listing_prefix(kind: &ResourceKind) -> String {
    format!("{}:", kind.plural)
}

pub fn search_key(query: &str) -> String {
    format!("{}{}", SEARCH_PREFIX, query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_and_listing_keys() {
        assert_eq!(item_key(&ResourceKind::POST, "p1"), "post:p1");
        assert_eq!(listing_key(&ResourceKind::POST, &ListingQuery::new(1, 10)), "posts:1:10");
        assert_eq!(
            listing_key(&ResourceKind::POST, &ListingQuery::new(2, 5).with_filter("user-7")),
            "posts:2:5:user-7"
        );
        assert_eq!(listing_prefix(&ResourceKind::POST), "posts:");
    }

    #[test]
    fn test_item_key_not_under_listing_prefix() {
        let prefix = listing_prefix(&ResourceKind::POST);
        assert!(!item_key(&ResourceKind::POST, "s:1:10").starts_with(&prefix));
    }

    #[test]
    fn test_from_params_defaults() {
        assert_eq!(ListingQuery::from_params(None, None), ListingQuery::new(1, 10));
        assert_eq!(
            ListingQuery::from_params(Some("abc"), Some("0")),
            ListingQuery::new(1, 10)
        );
        assert_eq!(
            ListingQuery::from_params(Some("3"), Some(" 25 ")),
            ListingQuery::new(3, 25)
        );
    }

    #[test]
    fn test_empty_filter_is_dropped() {
        assert_eq!(ListingQuery::new(1, 10).with_filter("").filter, None);
    }

    #[test]
    fn test_offset() {
        assert_eq!(ListingQuery::new(1, 10).offset(), 0);
        assert_eq!(ListingQuery::new(3, 10).offset(), 20);
    }

    #[test]
    fn test_search_key() {
        assert_eq!(search_key("rust"), "search:rust");
        assert!(search_key("rust").starts_with(SEARCH_PREFIX));
    }
}
