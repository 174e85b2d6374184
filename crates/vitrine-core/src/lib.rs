//! Core domain model for Vitrine: product records, deterministic
//! identifiers, URL normalization, and comparable-field equality.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vitrine-core";

/// Free-form per-product metadata persisted as a serialized JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProductMetadata {
    pub in_stock: bool,
    #[serde(default)]
    pub sizes_available: Vec<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

/// One catalog item from one source, shaped exactly like the products table.
///
/// Every field is always serialized (null for absent values) so that bulk
/// writes carry an identical key set across rows. Embeddings and the
/// store-assigned creation timestamp are not comparable fields: embeddings
/// are expensive to regenerate and their presence must not force update
/// churn, and the timestamp never round-trips through the scraper at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: Uuid,
    pub source: String,
    pub product_url: String,
    pub image_url: Option<String>,
    pub additional_images: Option<String>,
    pub brand: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub gender: Option<String>,
    pub price: Option<String>,
    pub size: Option<String>,
    pub metadata: Option<String>,
    pub tags: Option<Vec<String>>,
    pub country: Option<String>,
    pub second_hand: bool,
    pub sale: bool,
    pub other: Option<String>,
    #[serde(default)]
    pub image_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub info_embedding: Option<Vec<f32>>,
}

impl ProductRecord {
    /// Parse the serialized metadata payload, if present and well-formed.
    pub fn parsed_metadata(&self) -> Option<ProductMetadata> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Comparable-field equality: decides update vs. skip during sync.
    ///
    /// String fields treat `None` and `""` as equal; `tags` compare as
    /// unordered content. Identity fields (`id`, `source`, `product_url`)
    /// and embeddings are excluded: matching is done on normalized URL
    /// before this is called, and URL formatting drift alone must not
    /// force an update.
    pub fn same_listing(&self, other: &ProductRecord) -> bool {
        text_eq(&self.image_url, &other.image_url)
            && text_eq(&self.additional_images, &other.additional_images)
            && text_eq(&self.brand, &other.brand)
            && self.title == other.title
            && text_eq(&self.description, &other.description)
            && text_eq(&self.category, &other.category)
            && text_eq(&self.gender, &other.gender)
            && text_eq(&self.price, &other.price)
            && text_eq(&self.size, &other.size)
            && text_eq(&self.metadata, &other.metadata)
            && seq_eq(&self.tags, &other.tags)
            && text_eq(&self.country, &other.country)
            && self.second_hand == other.second_hand
            && self.sale == other.sale
            && text_eq(&self.other, &other.other)
    }
}

/// Derive the stable row identifier for `(source, product_url)`.
///
/// UUID v5 over the composed key: the same pair always yields the same id,
/// so re-scraping an unmoved page can never create a duplicate row.
pub fn product_id(source: &str, product_url: &str) -> Uuid {
    let key = format!("{source}:{product_url}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

/// Canonical comparison key for a product URL.
///
/// Trims whitespace, strips one trailing slash, and rewrites `http://` to
/// `https://` so scheme and slash drift never classify an unchanged page as
/// new or removed. Query strings and fragments are already stripped by the
/// extractor. Empty input yields empty output.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("https://{rest}")
    } else {
        trimmed.to_string()
    }
}

fn text_eq(a: &Option<String>, b: &Option<String>) -> bool {
    let left = a.as_deref().unwrap_or("");
    let right = b.as_deref().unwrap_or("");
    left == right
}

fn seq_eq(a: &Option<Vec<String>>, b: &Option<Vec<String>>) -> bool {
    let empty: Vec<String> = Vec::new();
    let mut left = a.as_ref().unwrap_or(&empty).clone();
    let mut right = b.as_ref().unwrap_or(&empty).clone();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> ProductRecord {
        ProductRecord {
            id: product_id("vitrine", url),
            source: "vitrine".to_string(),
            product_url: url.to_string(),
            image_url: None,
            additional_images: None,
            brand: Some("About Blank".to_string()),
            title: "Shirt".to_string(),
            description: None,
            category: Some("clothes".to_string()),
            gender: Some("man".to_string()),
            price: Some("20USD".to_string()),
            size: None,
            metadata: None,
            tags: None,
            country: Some("US".to_string()),
            second_hand: false,
            sale: false,
            other: None,
            image_embedding: None,
            info_embedding: None,
        }
    }

    #[test]
    fn product_id_is_stable_across_calls() {
        let a = product_id("vitrine", "https://s.com/products/x");
        let b = product_id("vitrine", "https://s.com/products/x");
        assert_eq!(a, b);
        assert_eq!(
            a.to_string(),
            product_id("vitrine", "https://s.com/products/x").to_string()
        );
    }

    #[test]
    fn product_id_partitions_by_source() {
        let a = product_id("vitrine", "https://s.com/products/x");
        let b = product_id("other", "https://s.com/products/x");
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_url_strips_scheme_and_slash_drift() {
        assert_eq!(
            normalize_url("http://example.com/products/x/"),
            "https://example.com/products/x"
        );
        assert_eq!(
            normalize_url("  https://example.com/products/x  "),
            "https://example.com/products/x"
        );
        assert_eq!(normalize_url(""), "");
    }

    #[test]
    fn normalize_url_strips_only_one_trailing_slash() {
        assert_eq!(
            normalize_url("https://example.com/products/x//"),
            "https://example.com/products/x/"
        );
    }

    #[test]
    fn none_and_empty_string_compare_equal() {
        let a = record("https://s.com/products/x");
        let mut b = a.clone();
        b.description = Some(String::new());
        assert!(a.same_listing(&b));
    }

    #[test]
    fn tags_compare_unordered() {
        let mut a = record("https://s.com/products/x");
        let mut b = a.clone();
        a.tags = Some(vec!["shop all".to_string(), "clothes".to_string()]);
        b.tags = Some(vec!["clothes".to_string(), "shop all".to_string()]);
        assert!(a.same_listing(&b));

        b.tags = Some(vec!["clothes".to_string()]);
        assert!(!a.same_listing(&b));
    }

    #[test]
    fn empty_tags_equal_none() {
        let mut a = record("https://s.com/products/x");
        let b = record("https://s.com/products/x");
        a.tags = Some(Vec::new());
        assert!(a.same_listing(&b));
    }

    #[test]
    fn embeddings_do_not_affect_listing_equality() {
        let a = record("https://s.com/products/x");
        let mut b = a.clone();
        b.image_embedding = Some(vec![0.1, 0.2, 0.3]);
        b.info_embedding = Some(vec![0.9; 8]);
        assert!(a.same_listing(&b));
    }

    #[test]
    fn price_change_breaks_listing_equality() {
        let a = record("https://s.com/products/x");
        let mut b = a.clone();
        b.price = Some("25USD".to_string());
        assert!(!a.same_listing(&b));
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let meta = ProductMetadata {
            in_stock: true,
            sizes_available: vec!["S".to_string(), "M".to_string()],
            collection: Some("shop all".to_string()),
        };
        let mut rec = record("https://s.com/products/x");
        rec.metadata = Some(serde_json::to_string(&meta).unwrap());
        assert_eq!(rec.parsed_metadata(), Some(meta));
    }
}
