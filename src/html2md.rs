//! HTML → Markdown conversion for help documents.
//!
//! Pure string-level transformation: no I/O, no side effects. Layout is not
//! preserved beyond headings, code blocks, tables, and lists — the output is
//! meant for embedding and agent consumption, not for rendering fidelity.
//!
//! Entities are decoded by the parser; the result is NFC-normalized so that
//! composed and decomposed forms of the same character compare (and search)
//! identically.

use scraper::{ElementRef, Html, Selector};
use unicode_normalization::UnicodeNormalization;

/// True when a byte prefix looks like an HTML document. Used to classify
/// extension-less files inside extracted archives.
pub fn looks_like_html_prefix(prefix: &str) -> bool {
    let head = prefix
        .get(..prefix.len().min(512))
        .unwrap_or(prefix)
        .trim_start()
        .to_lowercase();
    head.starts_with("<!doctype")
        || head.starts_with("<html")
        || head.starts_with("<head")
        || head.starts_with("<body")
        || head.contains("<html")
}

/// Convert an HTML document to Markdown.
pub fn html_to_markdown(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    render_children(doc.root_element(), &mut out, false);
    normalize_markdown(&out)
}

/// First `<h1>`/`<h2>` text, if any. Callers fall back to the filename stem.
pub fn extract_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("h1, h2").ok()?;
    for el in doc.select(&selector) {
        let text = collapse_whitespace(&el.text().collect::<String>());
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

/// First heading line of a Markdown document, stripped of `#` markers.
pub fn markdown_title(md: &str) -> Option<String> {
    md.lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|l| !l.is_empty())
}

fn render_children(el: ElementRef, out: &mut String, inline: bool) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            let collapsed = collapse_whitespace(text);
            if !collapsed.is_empty() {
                push_inline(out, &collapsed);
            }
        } else if let Some(child_el) = ElementRef::wrap(child) {
            render_element(child_el, out, inline);
        }
    }
}

fn render_element(el: ElementRef, out: &mut String, inline: bool) {
    let name = el.value().name();
    match name {
        "script" | "style" | "head" | "meta" | "link" | "title" => {}
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name.as_bytes()[1] - b'0';
            ensure_blank_line(out);
            for _ in 0..level {
                out.push('#');
            }
            out.push(' ');
            render_children(el, out, true);
            ensure_blank_line(out);
        }
        "p" => {
            ensure_blank_line(out);
            render_children(el, out, true);
            ensure_blank_line(out);
        }
        "br" => out.push('\n'),
        "hr" => {
            ensure_blank_line(out);
            out.push_str("---");
            ensure_blank_line(out);
        }
        "pre" => {
            ensure_blank_line(out);
            out.push_str("```\n");
            let raw: String = el.text().collect();
            out.push_str(raw.trim_matches('\n'));
            out.push_str("\n```");
            ensure_blank_line(out);
        }
        "code" => {
            let inner = render_inline(el);
            if !inner.is_empty() {
                push_inline(out, &format!("`{}`", inner));
            }
        }
        "b" | "strong" => {
            let inner = render_inline(el);
            if !inner.is_empty() {
                push_inline(out, &format!("**{}**", inner));
            }
        }
        "i" | "em" => {
            let inner = render_inline(el);
            if !inner.is_empty() {
                push_inline(out, &format!("*{}*", inner));
            }
        }
        "a" => {
            let href = el.value().attr("href").unwrap_or("").trim();
            if href.is_empty() || href.starts_with('#') {
                render_children(el, out, true);
            } else {
                let inner = render_inline(el);
                push_inline(out, &format!("[{}]({})", inner, href));
            }
        }
        "ul" | "ol" => {
            ensure_blank_line(out);
            let ordered = name == "ol";
            let mut index = 1usize;
            for child in el.children() {
                if let Some(li) = ElementRef::wrap(child) {
                    if li.value().name() == "li" {
                        if ordered {
                            out.push_str(&format!("{}. ", index));
                            index += 1;
                        } else {
                            out.push_str("- ");
                        }
                        render_children(li, out, true);
                        out.push('\n');
                    }
                }
            }
            ensure_blank_line(out);
        }
        "table" => {
            render_table(el, out);
        }
        // Table internals reached outside a <table> degrade to inline text.
        "tr" | "td" | "th" | "thead" | "tbody" => render_children(el, out, true),
        "body" | "html" | "div" | "section" | "article" | "main" | "span" | "font" => {
            render_children(el, out, inline);
            if !inline && matches!(name, "div" | "section" | "article") {
                ensure_blank_line(out);
            }
        }
        _ => render_children(el, out, inline),
    }
}

fn render_table(el: ElementRef, out: &mut String) {
    let row_sel = match Selector::parse("tr") {
        Ok(s) => s,
        Err(_) => return,
    };
    let cell_sel = match Selector::parse("td, th") {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut rows: Vec<Vec<String>> = Vec::new();
    for tr in el.select(&row_sel) {
        let cells: Vec<String> = tr
            .select(&cell_sel)
            .map(|cell| collapse_whitespace(&cell.text().collect::<String>()).replace('|', "\\|"))
            .collect();
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    if rows.is_empty() {
        return;
    }

    ensure_blank_line(out);
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for (i, row) in rows.iter().enumerate() {
        out.push('|');
        for col in 0..width {
            out.push(' ');
            out.push_str(row.get(col).map(String::as_str).unwrap_or(""));
            out.push_str(" |");
        }
        out.push('\n');
        if i == 0 {
            out.push('|');
            for _ in 0..width {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    ensure_blank_line(out);
}

/// Render an element's content as one inline string (used for code, bold,
/// italic, and link text so the marker wraps a complete token).
fn render_inline(el: ElementRef) -> String {
    let mut inner = String::new();
    render_children(el, &mut inner, true);
    inner.trim().to_string()
}

fn push_inline(out: &mut String, text: &str) {
    // Avoid gluing words together across adjacent inline nodes.
    if !out.is_empty()
        && !out.ends_with(char::is_whitespace)
        && !out.ends_with(['(', '['])
        && !text.starts_with(char::is_whitespace)
        && !text.starts_with([')', ']', '.', ',', ';', ':', '!', '?'])
    {
        out.push(' ');
    }
    out.push_str(text.trim_matches(|c: char| c == '\n'));
}

fn ensure_blank_line(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
    if out.is_empty() {
        return;
    }
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim trailing space, collapse 3+ blank lines, NFC-normalize.
fn normalize_markdown(s: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in s.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(trimmed.to_string());
    }
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    while lines.first().map(|l| l.is_empty()).unwrap_or(false) {
        lines.remove(0);
    }
    let joined = lines.join("\n");
    joined.nfc().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_become_hashes() {
        let md = html_to_markdown("<html><body><h1>Query language</h1><p>Intro.</p></body></html>");
        assert!(md.starts_with("# Query language"));
        assert!(md.contains("Intro."));
    }

    #[test]
    fn pre_becomes_fenced_code() {
        let md = html_to_markdown("<pre>Request = New Query;\nRequest.Run();</pre>");
        assert!(md.contains("```\nRequest = New Query;\nRequest.Run();\n```"));
    }

    #[test]
    fn inline_code_and_bold() {
        let md = html_to_markdown("<p>Use <code>Format</code> with <b>care</b></p>");
        assert!(md.contains("`Format`"));
        assert!(md.contains("**care**"));
    }

    #[test]
    fn table_becomes_pipe_table() {
        let md = html_to_markdown(
            "<table><tr><th>Name</th><th>Type</th></tr><tr><td>Value</td><td>String</td></tr></table>",
        );
        assert!(md.contains("| Name | Type |"));
        assert!(md.contains("| --- | --- |"));
        assert!(md.contains("| Value | String |"));
    }

    #[test]
    fn lists_render_markers() {
        let md = html_to_markdown("<ul><li>one</li><li>two</li></ul><ol><li>first</li></ol>");
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
        assert!(md.contains("1. first"));
    }

    #[test]
    fn anchors_are_dropped_real_links_kept() {
        let md = html_to_markdown(r##"<p><a href="#top">up</a> <a href="other.html">other</a></p>"##);
        assert!(!md.contains("(#top)"));
        assert!(md.contains("[other](other.html)"));
    }

    #[test]
    fn entities_decoded_and_nfc_applied() {
        let md = html_to_markdown("<p>caf&eacute;&nbsp;&amp;&nbsp;tea</p>");
        assert!(md.contains("café"));
        assert!(md.contains("&"));
        // NFC: decomposed e + combining acute collapses to one code point
        let md2 = html_to_markdown("<p>cafe\u{0301}</p>");
        assert!(md2.contains("café"));
    }

    #[test]
    fn title_prefers_first_heading() {
        assert_eq!(
            extract_title("<h2>Catalogs</h2><h1>Later</h1>"),
            Some("Catalogs".to_string())
        );
        assert_eq!(extract_title("<p>no headings</p>"), None);
    }

    #[test]
    fn markdown_title_strips_hashes() {
        assert_eq!(
            markdown_title("\n## Catalog manager\nbody"),
            Some("Catalog manager".to_string())
        );
        assert_eq!(markdown_title("   \n\n"), None);
    }

    #[test]
    fn html_sniffing() {
        assert!(looks_like_html_prefix("<!DOCTYPE html><html>"));
        assert!(looks_like_html_prefix("  <html lang=\"ru\">"));
        assert!(!looks_like_html_prefix("# Markdown heading"));
        assert!(!looks_like_html_prefix("binary\u{0}garbage"));
    }

    #[test]
    fn blank_lines_collapsed() {
        let md = html_to_markdown("<p>a</p><div></div><div></div><p>b</p>");
        assert!(!md.contains("\n\n\n"));
    }
}
