//! Page extractor: HTML heuristics turning storefront pages into product
//! records, plus catalog discovery parsing (collection pages and the
//! Shopify products.json fallback).

use std::collections::BTreeSet;

use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use vitrine_core::{product_id, ProductMetadata, ProductRecord};

pub const CRATE_NAME: &str = "vitrine-extract";

/// Collection-name keywords mapped to catalog categories.
const CLOTHES_COLLECTIONS: &[&str] = &[
    "t-shirts",
    "hoodies & sweats",
    "knitwear",
    "outerwear",
    "shirts",
    "vests",
];
const ACCESSORY_COLLECTIONS: &[&str] = &["accessories", "headwear"];

const ACCESSORY_TITLE_WORDS: &[&str] =
    &["hat", "cap", "beanie", "scarf", "belt", "bag", "wallet"];
const CLOTHES_TITLE_WORDS: &[&str] = &[
    "t-shirt",
    "hoodie",
    "sweatshirt",
    "jacket",
    "coat",
    "pants",
    "jeans",
    "shirt",
    "vest",
    "knitwear",
];

const OUT_OF_STOCK_INDICATORS: &[&str] = &[
    "sold out",
    "out of stock",
    "unavailable",
    "notify when available",
    "coming soon",
    "pre-order",
    "temporarily unavailable",
];

const GENERIC_IMAGE_ALT_WORDS: &[&str] = &["logo", "icon", "social", "menu", "search"];
const NON_PRODUCT_SRC_WORDS: &[&str] = &["icon", "logo", "social", "favicon", "menu"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("invalid products.json payload: {0}")]
    ProductsJson(String),
}

/// Per-storefront constants baked into every extracted record.
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub source: String,
    pub base_url: String,
    pub brand: String,
    pub country: String,
    pub currency: String,
}

/// Extract one product record from a product page.
///
/// Returns `Ok(None)` when no title can be found: a record without a title
/// is dropped here and never reaches the sync engine. Embedding fields are
/// left `None`; the pipeline fills them in afterwards.
pub fn extract_product(
    html: &str,
    url: &str,
    ctx: &ExtractContext,
) -> Result<Option<ProductRecord>, ExtractError> {
    let document = Html::parse_document(html);

    let Some(title) = extract_title(&document)? else {
        warn!(url, "could not extract title; dropping page");
        return Ok(None);
    };

    let description = extract_description(&document)?;
    let price = extract_price(&document)?;
    let images = product_image_urls(&document, &ctx.base_url)?;
    let image_url = images.first().cloned();
    let additional_images = if images.len() > 1 {
        Some(images[1..].join(" , "))
    } else {
        None
    };
    let sizes = extract_sizes(&document)?;
    let collection = collection_from_url(url);
    let category = determine_category(collection.as_deref(), &title);
    let gender = determine_gender(category.as_deref());
    let in_stock = is_in_stock(&document)?;

    let metadata = ProductMetadata {
        in_stock,
        sizes_available: sizes.clone(),
        collection: collection.clone(),
    };
    let metadata_json = serde_json::to_string(&metadata).ok();

    let mut tags = Vec::new();
    if let Some(collection) = &collection {
        tags.push(collection.clone());
    }
    if let Some(category) = &category {
        tags.push(category.clone());
    }

    Ok(Some(ProductRecord {
        id: product_id(&ctx.source, url),
        source: ctx.source.clone(),
        product_url: url.to_string(),
        image_url,
        additional_images,
        brand: Some(ctx.brand.clone()),
        title,
        description,
        category,
        gender,
        price: price.map(|value| format_price(value, &ctx.currency)),
        size: if sizes.is_empty() {
            None
        } else {
            Some(sizes.join(","))
        },
        metadata: metadata_json,
        tags: if tags.is_empty() { None } else { Some(tags) },
        country: Some(ctx.country.clone()),
        second_hand: false,
        sale: false,
        other: None,
        image_embedding: None,
        info_embedding: None,
    }))
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn clean_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| clean_text(&n.text().collect::<String>())))
}

fn extract_title(document: &Html) -> Result<Option<String>, ExtractError> {
    for css in [
        "h1.product-title",
        ".product-title h1",
        "h1[data-product-title]",
        ".product-name",
        "h1",
    ] {
        if let Some(title) = select_first_text(document, css)? {
            return Ok(Some(title));
        }
    }

    let meta = selector(r#"meta[property="og:title"]"#)?;
    Ok(document
        .select(&meta)
        .next()
        .and_then(|n| n.value().attr("content"))
        .and_then(clean_text))
}

fn extract_description(document: &Html) -> Result<Option<String>, ExtractError> {
    for css in [
        ".product-description",
        ".product-details",
        ".description",
        "[data-product-description]",
        ".tab-content .description",
    ] {
        if let Some(description) = select_first_text(document, css)? {
            return Ok(Some(description));
        }
    }

    // Structured-data fallback.
    let ld_json = selector(r#"script[type="application/ld+json"]"#)?;
    for script in document.select(&ld_json) {
        let raw = script.text().collect::<String>();
        if let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(&raw) {
            if let Some(description) = map.get("description").and_then(JsonValue::as_str) {
                return Ok(clean_text(description));
            }
        }
    }
    Ok(None)
}

fn extract_price(document: &Html) -> Result<Option<f64>, ExtractError> {
    for css in [".product-price", ".price", ".current-price", "[data-price]"] {
        let sel = selector(css)?;
        if let Some(node) = document.select(&sel).next() {
            if let Some(value) = price_from_text(&node.text().collect::<String>()) {
                return Ok(Some(value));
            }
        }
    }

    let scripts = selector("script")?;
    for script in document.select(&scripts) {
        let raw = script.text().collect::<String>();
        if let Some(value) = scan_quoted_field(&raw, "price").and_then(|s| price_from_text(&s)) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// First numeric amount in a price string, ignoring currency symbols.
pub fn price_from_text(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    let trimmed = current.trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        trimmed.parse().ok()
    }
}

/// Currency-tagged price string, e.g. `20USD` or `19.99USD`.
pub fn format_price(value: f64, currency: &str) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("{}{currency}", value.trunc() as i64)
    } else {
        format!("{value:.2}{currency}")
    }
}

fn extract_sizes(document: &Html) -> Result<Vec<String>, ExtractError> {
    let mut sizes = BTreeSet::new();

    let options = selector(r#"select[name="Size"] option"#)?;
    for option in document.select(&options) {
        if let Some(value) = option.value().attr("value") {
            if !value.is_empty() && value != "Size" {
                sizes.insert(value.to_string());
            }
        }
    }

    let swatches = selector(r#"input[name="Size"]"#)?;
    for swatch in document.select(&swatches) {
        if let Some(value) = swatch.value().attr("value") {
            if !value.is_empty() {
                sizes.insert(value.to_string());
            }
        }
    }

    let scripts = selector("script")?;
    for script in document.select(&scripts) {
        let raw = script.text().collect::<String>();
        if raw.contains("variants") {
            for value in scan_variant_option_values(&raw) {
                sizes.insert(value);
            }
        }
    }

    Ok(sizes.into_iter().collect())
}

/// Scan Shopify variant JSON for `"optionN":"value"` pairs.
fn scan_variant_option_values(script: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut cursor = script;
    while let Some(pos) = cursor.find("\"option") {
        cursor = &cursor[pos + "\"option".len()..];
        let digit_count = cursor.len()
            - cursor
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .len();
        if digit_count == 0 {
            continue;
        }
        cursor = &cursor[digit_count..];
        let Some(after_name) = cursor.strip_prefix('"') else {
            continue;
        };
        let after_colon = after_name.trim_start();
        let Some(after_colon) = after_colon.strip_prefix(':') else {
            cursor = after_name;
            continue;
        };
        let after_colon = after_colon.trim_start();
        let Some(value_start) = after_colon.strip_prefix('"') else {
            cursor = after_colon;
            continue;
        };
        let Some(end) = value_start.find('"') else {
            break;
        };
        let value = &value_start[..end];
        cursor = &value_start[end + 1..];
        if !value.is_empty() && !value.eq_ignore_ascii_case("default title") {
            values.push(value.to_string());
        }
    }
    values
}

/// Find `"name":"value"` in raw script text without parsing the whole blob.
fn scan_quoted_field(script: &str, name: &str) -> Option<String> {
    let needle = format!("\"{name}\"");
    let pos = script.find(&needle)?;
    let rest = script[pos + needle.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn resolve_image_url(src: &str, base_url: &str) -> String {
    if let Some(rest) = src.strip_prefix("//") {
        format!("https://{rest}")
    } else if src.starts_with('/') {
        format!("{}{src}", base_url.trim_end_matches('/'))
    } else if !src.starts_with("http") {
        format!("{}/{src}", base_url.trim_end_matches('/'))
    } else {
        src.to_string()
    }
}

fn img_src(img: &ElementRef<'_>) -> Option<String> {
    let el = img.value();
    el.attr("src")
        .or_else(|| el.attr("data-src"))
        .or_else(|| el.attr("data-lazy-src"))
        .map(str::to_string)
}

/// All product image URLs in priority order: alt-described product shots,
/// then shop-CDN images, then anything that is not clearly site chrome.
pub fn product_image_urls(document: &Html, base_url: &str) -> Result<Vec<String>, ExtractError> {
    let imgs = selector("img")?;
    let mut urls = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |src: String| {
        let resolved = resolve_image_url(&src, base_url);
        if seen.insert(resolved.clone()) {
            urls.push(resolved);
        }
    };

    for img in document.select(&imgs) {
        let Some(src) = img_src(&img) else { continue };
        let alt = img.value().attr("alt").unwrap_or("").to_lowercase();
        if alt.len() > 3 && !GENERIC_IMAGE_ALT_WORDS.iter().any(|w| alt.contains(w)) {
            push(src);
        }
    }

    for img in document.select(&imgs) {
        let Some(src) = img_src(&img) else { continue };
        if src.contains("cdn/shop/files") {
            push(src);
        }
    }

    for img in document.select(&imgs) {
        let Some(src) = img_src(&img) else { continue };
        let lower = src.to_lowercase();
        if !NON_PRODUCT_SRC_WORDS.iter().any(|w| lower.contains(w)) {
            push(src);
        }
    }

    Ok(urls)
}

/// Stock heuristic: out-of-stock wording wins, then user-facing add-to-cart
/// affordances, then script variant data. Defaults to out of stock.
pub fn is_in_stock(document: &Html) -> Result<bool, ExtractError> {
    let text = document.root_element().text().collect::<String>().to_lowercase();
    if OUT_OF_STOCK_INDICATORS.iter().any(|w| text.contains(w)) {
        return Ok(false);
    }

    let buttons = selector("button")?;
    let mut saw_cart_button = false;
    for button in document.select(&buttons) {
        let label = button.text().collect::<String>().to_lowercase();
        if !["add to cart", "add to bag", "buy now", "shop now"]
            .iter()
            .any(|phrase| label.contains(phrase))
        {
            continue;
        }
        if button.value().attr("disabled").is_some() {
            continue;
        }
        saw_cart_button = true;
        let inactive = button
            .value()
            .classes()
            .any(|c| c.to_lowercase().contains("disabled") || c.to_lowercase().contains("unavailable"));
        if !inactive {
            return Ok(true);
        }
    }

    let cart_forms = selector(r#"form[action*="/cart/add"]"#)?;
    for form in document.select(&cart_forms) {
        let hidden = form.value().attr("style") == Some("display: none");
        if !hidden && form.value().attr("disabled").is_none() {
            return Ok(true);
        }
    }

    let quantity = selector(r#"input[type="number"][name="quantity"]"#)?;
    if let Some(input) = document.select(&quantity).next() {
        if input.value().attr("disabled").is_none() {
            return Ok(true);
        }
    }

    for css in [r#"select[name="Size"]"#, r#"select[name="variant"]"#] {
        let sel = selector(css)?;
        if let Some(node) = document.select(&sel).next() {
            if node.value().attr("disabled").is_none() {
                return Ok(true);
            }
        }
    }

    let scripts = selector("script")?;
    for script in document.select(&scripts) {
        if script.text().collect::<String>().contains("\"available\":true") {
            return Ok(true);
        }
    }

    let product_forms = selector("form")?;
    for form in document.select(&product_forms) {
        let relevant = form
            .value()
            .classes()
            .any(|c| c.contains("product") || c.contains("add-to-cart"));
        if relevant
            && form.value().attr("disabled").is_none()
            && form.value().attr("style") != Some("display: none")
        {
            return Ok(true);
        }
    }

    // Script data is often stale; trust the visible button if one exists.
    Ok(saw_cart_button)
}

pub fn collection_from_url(url: &str) -> Option<String> {
    let marker = "/collections/";
    let pos = url.find(marker)?;
    let rest = &url[pos + marker.len()..];
    let end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let handle = &rest[..end];
    if handle.is_empty() {
        None
    } else {
        Some(handle.replace('-', " "))
    }
}

pub fn determine_category(collection: Option<&str>, title: &str) -> Option<String> {
    let collection = collection.unwrap_or("").to_lowercase();
    if CLOTHES_COLLECTIONS.iter().any(|k| collection.contains(k)) {
        return Some("clothes".to_string());
    }
    if ACCESSORY_COLLECTIONS.iter().any(|k| collection.contains(k)) {
        return Some("accessories".to_string());
    }

    let title = title.to_lowercase();
    if ACCESSORY_TITLE_WORDS.iter().any(|w| title.contains(w)) {
        return Some("accessories".to_string());
    }
    if CLOTHES_TITLE_WORDS.iter().any(|w| title.contains(w)) {
        return Some("clothes".to_string());
    }
    None
}

pub fn determine_gender(category: Option<&str>) -> Option<String> {
    // Accessories are unisex; everything else in this catalog is menswear.
    match category {
        Some("accessories") => None,
        _ => Some("man".to_string()),
    }
}

/// Product links on a collection listing page, absolute and stripped of
/// query strings and fragments, in document order without duplicates.
pub fn parse_product_links(html: &str, base_url: &str) -> Result<Vec<String>, ExtractError> {
    let document = Html::parse_document(html);
    let anchors = selector("a[href]")?;
    let mut seen = BTreeSet::new();
    let mut urls = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.contains("/products/") {
            continue;
        }
        let absolute = if href.starts_with('/') {
            format!("{}{href}", base_url.trim_end_matches('/'))
        } else {
            href.to_string()
        };
        let stripped = absolute
            .split('?')
            .next()
            .unwrap_or(&absolute)
            .split('#')
            .next()
            .unwrap_or(&absolute)
            .to_string();
        if seen.insert(stripped.clone()) {
            urls.push(stripped);
        }
    }
    Ok(urls)
}

/// Whether the listing page links to a next page of results.
pub fn has_next_page(html: &str) -> Result<bool, ExtractError> {
    let document = Html::parse_document(html);
    let anchors = selector("a")?;
    Ok(document.select(&anchors).any(|a| {
        a.text()
            .collect::<String>()
            .trim()
            .eq_ignore_ascii_case("next")
    }))
}

/// One page of the Shopify `products.json` fallback: product URLs plus the
/// raw product count (the caller stops paging below a full page).
pub fn parse_products_json(
    json_text: &str,
    base_url: &str,
) -> Result<(Vec<String>, usize), ExtractError> {
    let value: JsonValue = serde_json::from_str(json_text)
        .map_err(|e| ExtractError::ProductsJson(e.to_string()))?;
    let products = value
        .get("products")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ExtractError::ProductsJson("missing products array".to_string()))?;
    let count = products.len();
    let urls = products
        .iter()
        .filter_map(|p| p.get("handle").and_then(JsonValue::as_str))
        .map(|handle| format!("{}/products/{handle}", base_url.trim_end_matches('/')))
        .collect();
    Ok((urls, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExtractContext {
        ExtractContext {
            source: "vitrine".to_string(),
            base_url: "https://shop.example".to_string(),
            brand: "About Blank".to_string(),
            country: "US".to_string(),
            currency: "USD".to_string(),
        }
    }

    const PRODUCT_PAGE: &str = r#"
        <html><head><meta property="og:title" content="Meta Title"></head><body>
        <h1 class="product-title">Heavyweight Shirt</h1>
        <div class="product-description">Boxy fit, brushed cotton.</div>
        <span class="price">£120.00</span>
        <img src="//cdn.example/cdn/shop/files/shirt-front.jpg" alt="Heavyweight Shirt front">
        <img src="/images/shirt-back.jpg" alt="Heavyweight Shirt back">
        <img src="/assets/logo.png" alt="logo">
        <form action="/cart/add">
          <select name="Size">
            <option value="Size">Size</option>
            <option value="M">M</option>
            <option value="L">L</option>
          </select>
          <button>Add to cart</button>
        </form>
        </body></html>
    "#;

    #[test]
    fn extracts_full_product_record() {
        let url = "https://shop.example/collections/shop-all/products/heavyweight-shirt";
        let record = extract_product(PRODUCT_PAGE, url, &ctx())
            .unwrap()
            .expect("record");

        assert_eq!(record.title, "Heavyweight Shirt");
        assert_eq!(record.description.as_deref(), Some("Boxy fit, brushed cotton."));
        assert_eq!(record.price.as_deref(), Some("120USD"));
        assert_eq!(record.size.as_deref(), Some("L,M"));
        assert_eq!(
            record.image_url.as_deref(),
            Some("https://cdn.example/cdn/shop/files/shirt-front.jpg")
        );
        assert_eq!(
            record.additional_images.as_deref(),
            Some("https://shop.example/images/shirt-back.jpg")
        );
        assert_eq!(record.category.as_deref(), Some("clothes"));
        assert_eq!(record.gender.as_deref(), Some("man"));
        assert_eq!(record.id, product_id("vitrine", url));

        let metadata = record.parsed_metadata().expect("metadata");
        assert!(metadata.in_stock);
        assert_eq!(metadata.collection.as_deref(), Some("shop all"));
        assert_eq!(metadata.sizes_available, vec!["L", "M"]);
    }

    #[test]
    fn page_without_title_is_dropped() {
        let html = "<html><body><div class='price'>$10</div></body></html>";
        let record = extract_product(html, "https://shop.example/products/x", &ctx()).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn title_falls_back_to_og_meta() {
        let html = r#"<html><head><meta property="og:title" content="Meta Only"></head>
            <body><p>no heading</p></body></html>"#;
        let record = extract_product(html, "https://shop.example/products/x", &ctx())
            .unwrap()
            .expect("record");
        assert_eq!(record.title, "Meta Only");
    }

    #[test]
    fn sold_out_wording_beats_cart_button() {
        let html = r#"<html><body><h1>Shirt</h1>
            <p>Sold out</p><button>Add to cart</button></body></html>"#;
        let document = Html::parse_document(html);
        assert!(!is_in_stock(&document).unwrap());
    }

    #[test]
    fn disabled_cart_button_is_out_of_stock() {
        let html = r#"<html><body><h1>Shirt</h1>
            <button disabled>Add to cart</button></body></html>"#;
        let document = Html::parse_document(html);
        assert!(!is_in_stock(&document).unwrap());
    }

    #[test]
    fn variant_script_sizes_are_collected() {
        let script = r#"var variants = [{"option1":"S","price":"12000"},
            {"option1":"M"},{"option1":"Default Title"}]"#;
        assert_eq!(scan_variant_option_values(script), vec!["S", "M"]);
    }

    #[test]
    fn price_parses_from_text_and_scripts() {
        assert_eq!(price_from_text("£120.00"), Some(120.0));
        assert_eq!(price_from_text("$ 19.99 USD"), Some(19.99));
        assert_eq!(price_from_text("no digits"), None);
        assert_eq!(
            scan_quoted_field(r#"{"price" : "45.00"}"#, "price").as_deref(),
            Some("45.00")
        );
    }

    #[test]
    fn format_price_drops_zero_cents() {
        assert_eq!(format_price(20.0, "USD"), "20USD");
        assert_eq!(format_price(19.99, "USD"), "19.99USD");
    }

    #[test]
    fn discovery_strips_query_and_fragment() {
        let html = r#"<html><body>
            <a href="/products/shirt?variant=1">Shirt</a>
            <a href="https://shop.example/products/hat#top">Hat</a>
            <a href="/products/shirt">Shirt again</a>
            <a href="/pages/about">About</a>
            <a>Next</a>
        </body></html>"#;
        let urls = parse_product_links(html, "https://shop.example").unwrap();
        assert_eq!(
            urls,
            vec![
                "https://shop.example/products/shirt",
                "https://shop.example/products/hat",
            ]
        );
        assert!(has_next_page(html).unwrap());
    }

    #[test]
    fn products_json_fallback_yields_urls() {
        let payload = r#"{"products":[{"handle":"shirt"},{"handle":"hat"},{"title":"no handle"}]}"#;
        let (urls, count) = parse_products_json(payload, "https://shop.example/").unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            urls,
            vec![
                "https://shop.example/products/shirt",
                "https://shop.example/products/hat",
            ]
        );
    }

    #[test]
    fn category_mapping_prefers_collection_over_title() {
        assert_eq!(
            determine_category(Some("hoodies & sweats"), "anything"),
            Some("clothes".to_string())
        );
        assert_eq!(
            determine_category(Some("headwear"), "anything"),
            Some("accessories".to_string())
        );
        assert_eq!(
            determine_category(None, "Wool Beanie"),
            Some("accessories".to_string())
        );
        assert_eq!(determine_category(None, "Gift Card"), None);
    }

    #[test]
    fn gender_follows_category() {
        assert_eq!(determine_gender(Some("accessories")), None);
        assert_eq!(determine_gender(Some("clothes")).as_deref(), Some("man"));
        assert_eq!(determine_gender(None).as_deref(), Some("man"));
    }

    #[test]
    fn collection_handle_parses_from_url() {
        assert_eq!(
            collection_from_url("https://shop.example/collections/shop-all/products/x"),
            Some("shop all".to_string())
        );
        assert_eq!(collection_from_url("https://shop.example/products/x"), None);
    }
}
