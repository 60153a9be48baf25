//! The control page.

const TEMPLATE: &str = include_str!("index.html");
const FEED_SLOT: &str = "{{FEED}}";

/// Render the page, embedding the video feed for `selector` when one is chosen.
pub(crate) fn render_index(selector: Option<&str>) -> String {
    let feed = match selector {
        Some(selector) => {
            let encoded: String = url::form_urlencoded::byte_serialize(selector.as_bytes()).collect();
            format!(
                "<section>\n    <h2>Live detection: {}</h2>\n    <img class=\"feed\" src=\"/video_feed?file={}\" alt=\"video feed\">\n  </section>",
                escape_html(selector),
                encoded
            )
        }
        None => String::new(),
    };
    TEMPLATE.replace(FEED_SLOT, &feed)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
