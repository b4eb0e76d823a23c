//! MIME decoding (RFC 2045-2047) and `format=flowed` (RFC 3676) handling for
//! message bodies. Adapted from the teacher's MIME walker and URL cleaner;
//! the output shape changed from a flat `BodyRecord` to the richer
//! [`Body`]/[`BodyPart`] pair the core now works with.

use crate::types::{Body, BodyPart, Uid};
use html2text::from_read;
use mailparse::body::Body as PartBody;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use url::{form_urlencoded, Url};

/// Parses a raw RFC-822 message and derives the rendering fields the
/// controller needs. Never fails: unparsable bytes degrade to a body whose
/// `plain_text` is the raw bytes decoded lossily, matching the cache's
/// never-fail-the-action posture (spec §7).
pub fn body_from_raw(uid: Uid, raw: Vec<u8>, process_html: bool) -> Body {
    match parse_mail(&raw) {
        Ok(parsed) => {
            let mut parts = Vec::new();
            collect_parts(&parsed, "1", &mut parts);
            let format_flowed = is_format_flowed(&parsed);

            let plain = extract_preferred_text(&parsed, false);
            let html = extract_preferred_text(&parsed, true);

            let plain_text = match (&plain, process_html) {
                (Some(p), _) => Some(dewrap_if_flowed(p, format_flowed)),
                (None, true) => html.clone().map(|h| html_to_text(h.as_bytes())),
                (None, false) => None,
            };

            Body {
                uid,
                raw,
                plain_text,
                html,
                parts,
                format_flowed,
                html_parsed: process_html,
            }
        }
        Err(_) => Body {
            uid,
            plain_text: Some(String::from_utf8_lossy(&raw).to_string()),
            html: None,
            parts: Vec::new(),
            format_flowed: false,
            html_parsed: false,
            raw,
        },
    }
}

fn is_format_flowed(part: &ParsedMail) -> bool {
    part.headers
        .get_first_value("Content-Type")
        .map(|v| v.to_ascii_lowercase().contains("format=flowed"))
        .unwrap_or(false)
}

/// Undoes RFC 3676 soft-wrapping: a trailing space before a newline marks a
/// soft break that should be joined with the next line, unless the line is
/// a `-- ` signature separator or starts a quoted (`>`) block at a different
/// depth than the one before it.
fn dewrap_if_flowed(text: &str, flowed: bool) -> String {
    if !flowed {
        return text.to_string();
    }
    let mut out = String::new();
    let mut prev_quote_depth: Option<usize> = None;
    for line in text.split('\n') {
        let depth = line.chars().take_while(|c| *c == '>').count();
        let stripped = line.trim_start_matches('>').strip_prefix(' ').unwrap_or(line.trim_start_matches('>'));
        let is_sig_sep = stripped == "-- ";
        let soft_break = line.ends_with(' ') && !is_sig_sep;

        if Some(depth) != prev_quote_depth && prev_quote_depth.is_some() {
            out.push('\n');
        }
        out.push_str(stripped);
        if !soft_break {
            out.push('\n');
        }
        prev_quote_depth = Some(depth);
    }
    out
}

fn collect_parts(part: &ParsedMail, index: &str, out: &mut Vec<BodyPart>) {
    if out.len() > 300 {
        return;
    }
    let ctype = &part.ctype;
    let is_container = ctype.mimetype.starts_with("multipart/") && !part.subparts.is_empty();

    if !is_container {
        let filename = extract_filename(part);
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|v| v.trim().trim_matches(&['<', '>'][..]).to_string());
        let encoded_bytes = match part.get_body_encoded() {
            PartBody::Base64(b) => b.get_raw().to_vec(),
            PartBody::QuotedPrintable(b) => b.get_raw().to_vec(),
            PartBody::SevenBit(b) => b.get_raw().to_vec(),
            PartBody::EightBit(b) => b.get_raw().to_vec(),
            PartBody::Binary(b) => b.get_raw().to_vec(),
        };
        out.push(BodyPart {
            index: index.to_string(),
            mime_type: ctype.mimetype.clone(),
            filename,
            content_id,
            size: encoded_bytes.len(),
            encoded_bytes,
        });
    }

    for (i, child) in part.subparts.iter().enumerate() {
        collect_parts(child, &format!("{index}.{}", i + 1), out);
    }
}

fn extract_filename(part: &ParsedMail) -> Option<String> {
    let disp = part.get_content_disposition();
    let disp_name = disp.params.get("filename").or_else(|| disp.params.get("name")).cloned();
    let ctype_name = part
        .ctype
        .params
        .get("name")
        .or_else(|| part.ctype.params.get("filename"))
        .cloned();
    disp_name.or(ctype_name).and_then(|v| {
        let t = v.trim();
        (!t.is_empty()).then(|| t.to_string())
    })
}

/// Extracts either the preferred plain-text rendering or the raw HTML part,
/// following `multipart/alternative`'s stated preference order.
fn extract_preferred_text(part: &ParsedMail, want_html: bool) -> Option<String> {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    if part.subparts.is_empty() {
        if !want_html && mimetype == "text/plain" {
            let body = String::from_utf8_lossy(part.get_body_raw().unwrap_or_default().as_ref()).to_string();
            return Some(clean_urls_in_text(&body));
        }
        if want_html && mimetype == "text/html" {
            let body = part.get_body_raw().unwrap_or_default();
            return Some(clean_urls_in_text(&String::from_utf8_lossy(&body)));
        }
        return None;
    }

    if mimetype.starts_with("multipart/alternative") {
        let preferred_type = if want_html { "text/html" } else { "text/plain" };
        if let Some(p) = part.subparts.iter().find(|p| p.ctype.mimetype.eq_ignore_ascii_case(preferred_type)) {
            if let Some(text) = extract_preferred_text(p, want_html) {
                return Some(text);
            }
        }
    }

    for child in &part.subparts {
        if let Some(text) = extract_preferred_text(child, want_html) {
            return Some(text);
        }
    }
    None
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, 80).unwrap_or_default()
}

fn clean_urls_in_text(body: &str) -> String {
    static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>()"']+"#).unwrap());
    URL_RE.replace_all(body, |caps: &regex::Captures| clean_url(&caps[0])).into_owned()
}

fn clean_url(raw: &str) -> String {
    const DROP_EXACT: &[&str] = &[
        "gclid", "dclid", "fbclid", "msclkid", "yclid", "mc_eid", "mc_cid", "mkt_tok", "lipi",
        "loid", "trackingId", "trackId", "tracking", "token",
    ];
    const DROP_PREFIXES: &[&str] = &["utm_", "mc_", "mkt_", "li_", "oly_"];

    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let key = k.as_ref();
            !DROP_EXACT.contains(&key) && !DROP_PREFIXES.iter().any(|p| key.starts_with(p))
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
        return parsed.to_string();
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in &kept {
        serializer.append_pair(k, v);
    }
    let new_query = serializer.finish();
    parsed.set_query(Some(&new_query));
    parsed.to_string()
}

/// Decodes an RFC 2047 encoded-word header value (`=?charset?Q/B?...?=`).
pub fn decode_header_value(raw: &str) -> String {
    let raw_header = format!("X: {raw}");
    mailparse::parse_header(raw_header.as_bytes())
        .map(|(header, _)| header.get_value())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_round_trips_simple_message() {
        let raw = b"From: a@x.test\r\nTo: b@x.test\r\nSubject: hi\r\n\r\nhello world\r\n".to_vec();
        let body = body_from_raw(1, raw, false);
        assert_eq!(body.plain_text.as_deref(), Some("hello world\r\n"));
    }

    #[test]
    fn unparsable_bytes_degrade_to_lossy_text() {
        let raw = vec![0xff, 0xfe, 0x00];
        let body = body_from_raw(1, raw, false);
        assert!(body.plain_text.is_some());
    }

    #[test]
    fn format_flowed_joins_soft_wrapped_lines() {
        let joined = dewrap_if_flowed("this is a \nsoft-wrapped line\n", true);
        assert_eq!(joined, "this is a soft-wrapped line\n");
    }

    #[test]
    fn format_flowed_preserves_signature_separator() {
        let joined = dewrap_if_flowed("body text\n-- \nsig line\n", true);
        assert!(joined.contains("-- \n"));
    }

    #[test]
    fn tracker_query_params_are_stripped() {
        let cleaned = clean_url("https://example.test/path?utm_source=x&id=1");
        assert!(!cleaned.contains("utm_source"));
        assert!(cleaned.contains("id=1"));
    }

    #[test]
    fn decode_header_value_handles_encoded_words() {
        let decoded = decode_header_value("=?UTF-8?B?aGVsbG8=?=");
        assert_eq!(decoded, "hello");
    }
}
