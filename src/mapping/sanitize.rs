//! Text sanitization used while mapping CSV cells onto post fields.

use once_cell::sync::Lazy;
use regex::Regex;

static DANGEROUS_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|iframe|object|embed)\b[^>]*>.*?</(script|style|iframe|object|embed)\s*>")
        .expect("valid block regex")
});
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Filter markup for title, content and excerpt against an allow-list of
/// post tags and attributes. Executable elements, event handlers and
/// script URLs never survive.
pub fn filter_html(input: &str) -> String {
    ammonia::Builder::default()
        .link_rel(None)
        .clean(input)
        .to_string()
        .trim()
        .to_string()
}

/// Plain single-line text: tags stripped, whitespace collapsed.
pub fn sanitize_text_field(input: &str) -> String {
    let stripped = DANGEROUS_BLOCKS.replace_all(input, "");
    let stripped = ANY_TAG.replace_all(&stripped, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// URL-safe slug: lowercase ascii letters, digits, `_` and single dashes.
pub fn sanitize_title(input: &str) -> String {
    let stripped = ANY_TAG.replace_all(input, "");
    let mut slug = String::with_capacity(stripped.len());
    let mut pending_dash = false;

    for c in stripped.chars().flat_map(fold_accent) {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '.' || c == '/' {
            pending_dash = true;
        }
    }
    slug
}

/// Lowercase key restricted to `[a-z0-9_-]`.
pub fn sanitize_key(input: &str) -> String {
    input
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// File name safe to store on disk or in an object store.
pub fn sanitize_file_name(input: &str) -> String {
    const SPECIAL: &[char] = &[
        '?', '[', ']', '/', '\\', '=', '<', '>', ':', ';', ',', '\'', '"', '&', '$', '#', '*', '(',
        ')', '|', '~', '`', '!', '{', '}', '%', '+',
    ];
    let cleaned: String = input
        .chars()
        .filter(|c| !SPECIAL.contains(c) && !c.is_control())
        .collect();
    let dashed = WHITESPACE.replace_all(cleaned.trim(), "-");
    let mut out = String::with_capacity(dashed.len());
    for c in dashed.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c| c == '.' || c == '-' || c == '_').to_string()
}

pub fn strip_bom(input: &str) -> &str {
    input.strip_prefix('\u{feff}').unwrap_or(input)
}

fn fold_accent(c: char) -> Vec<char> {
    let folded: &str = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'č' | 'ć' => "c",
        'Ç' | 'Č' | 'Ć' => "C",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' => "I",
        'ñ' | 'ń' => "n",
        'Ñ' | 'Ń' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' => "O",
        'š' | 'ś' => "s",
        'Š' | 'Ś' => "S",
        'ß' => "ss",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' => "Y",
        'ž' | 'ź' | 'ż' => "z",
        'Ž' | 'Ź' | 'Ż' => "Z",
        _ => return vec![c],
    };
    folded.chars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_filter_removes_executable_markup() {
        let input = r#"<p onclick="steal()">Hi <a href="javascript:alert(1)">x</a></p><script>alert(1)</script>"#;
        let out = filter_html(input);
        assert!(out.starts_with("<p>Hi <a"));
        assert!(out.ends_with(">x</a></p>"));
        assert!(!out.contains("onclick"));
        assert!(!out.contains("javascript"));
        assert!(!out.contains("script"));

        let out = filter_html(r#"<svg/onload=alert(1)><img src=x/onerror=alert(2)>"#);
        assert!(!out.contains("onload"));
        assert!(!out.contains(" onerror"));
        assert!(!out.contains("<svg"));

        let out = filter_html(r#"<iframe src="https://evil.example"></iframe><style>p{}</style>ok"#);
        assert_eq!(out, "ok");
    }

    #[test]
    fn html_filter_keeps_plain_markup() {
        assert_eq!(filter_html("  <strong>Bold</strong> move "), "<strong>Bold</strong> move");
    }

    #[test]
    fn slugs() {
        assert_eq!(sanitize_title("Hello, World!"), "hello-world");
        assert_eq!(sanitize_title("  Crème brûlée -- recipe "), "creme-brulee-recipe");
        assert_eq!(sanitize_title("<b>Tagged</b> title_1"), "tagged-title_1");
        assert_eq!(sanitize_title("!!!"), "");
    }

    #[test]
    fn text_field_is_single_line() {
        assert_eq!(sanitize_text_field(" A <em>cat</em>\n\t on  a mat "), "A cat on a mat");
    }

    #[test]
    fn keys_and_file_names() {
        assert_eq!(sanitize_key("Price (USD)"), "priceusd");
        assert_eq!(sanitize_key("_sku-code"), "_sku-code");
        assert_eq!(sanitize_file_name("my file (1).csv"), "my-file-1.csv");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "etcpasswd");
    }

    #[test]
    fn bom_is_removed_once() {
        assert_eq!(strip_bom("\u{feff}Title"), "Title");
        assert_eq!(strip_bom("Title"), "Title");
    }
}
