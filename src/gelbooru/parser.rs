use once_cell::sync::Lazy;
use scraper::{Html, Selector};

static THUMB_LINKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span.thumb a[href]").expect("Invalid CSS selector"));

/// Extracts the ordered list of post identifiers from one favorites page.
///
/// Each favorite is rendered as a `span.thumb` wrapping a link whose href
/// ends in `id=<post id>`. Malformed markup simply yields fewer (or zero)
/// identifiers, never an error.
pub(crate) fn favorite_post_ids(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);

    document
        .select(&THUMB_LINKS)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| href.rsplit('=').next())
        .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ids_in_page_order() {
        let html = r#"
            <html><body>
              <span class="thumb"><a href="index.php?page=post&s=view&id=101"><img/></a></span>
              <span class="thumb"><a href="index.php?page=post&s=view&id=202"><img/></a></span>
              <span class="thumb"><a href="index.php?page=post&s=view&id=303"><img/></a></span>
            </body></html>
        "#;
        assert_eq!(favorite_post_ids(html), vec!["101", "202", "303"]);
    }

    #[test]
    fn ignores_unrelated_links_and_junk_hrefs() {
        let html = r#"
            <html><body>
              <a href="index.php?page=post&s=view&id=999">not a thumb</a>
              <span class="thumb"><a href="index.php?page=post&s=view&id=17"><img/></a></span>
              <span class="thumb"><a href="javascript:void(0)"><img/></a></span>
            </body></html>
        "#;
        assert_eq!(favorite_post_ids(html), vec!["17"]);
    }

    #[test]
    fn empty_or_malformed_page_yields_no_ids() {
        assert!(favorite_post_ids("").is_empty());
        assert!(favorite_post_ids("<html><body><p>nothing here</p>").is_empty());
    }
}
