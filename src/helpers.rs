use std::convert::TryFrom;

use encoding_rs::{Encoding, UTF_8};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use httparse::Header;
use percent_encoding::percent_decode;

pub(crate) fn convert_raw_headers_to_header_map(raw_headers: &[Header]) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw_headers.len());

    for raw_header in raw_headers {
        let name = HeaderName::try_from(raw_header.name).map_err(|err| crate::Error::DecodeHeaderName {
            name: raw_header.name.to_owned(),
            cause: err.into(),
        })?;

        let value = HeaderValue::from_bytes(raw_header.value).map_err(|err| crate::Error::DecodeHeaderValue {
            value: raw_header.value.to_owned(),
            cause: err.into(),
        })?;

        headers.append(name, value);
    }

    Ok(headers)
}

pub(crate) fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Whether every `%` in `input` starts a well-formed `%XX` escape.
pub(crate) fn has_only_valid_escapes(input: &[u8]) -> bool {
    input.iter().enumerate().filter(|(_, b)| **b == b'%').all(|(i, _)| {
        i + 2 < input.len()
            && hex_value(input[i + 1]).is_some()
            && hex_value(input[i + 2]).is_some()
    })
}

/// Turns an attacker supplied filename into a bare base name.
///
/// Percent escapes are decoded only when all of them are well formed, and
/// RFC 2047 encoded words are decoded. Everything up to the last `/` or `\`
/// is dropped, and NUL bytes are written back as `%00`.
pub(crate) fn sanitize_filename(raw: &str, decode: bool) -> String {
    let decoded = if !decode {
        raw.to_owned()
    } else if raw.starts_with("=?") && raw.trim_end().ends_with("?=") {
        decode_encoded_words(raw).unwrap_or_else(|| raw.to_owned())
    } else if raw.contains('%') && has_only_valid_escapes(raw.as_bytes()) {
        percent_decode(raw.as_bytes()).decode_utf8_lossy().into_owned()
    } else {
        raw.to_owned()
    };

    let base = match decoded.rfind(&['/', '\\'][..]) {
        Some(idx) => &decoded[idx + 1..],
        None => &decoded[..],
    };

    base.replace('\0', "%00")
}

/// Decodes a run of RFC 2047 encoded words (`=?charset?B|Q?text?=`),
/// separated by optional whitespace.
pub(crate) fn decode_encoded_words(raw: &str) -> Option<String> {
    let mut out = String::new();
    let mut rest = raw.trim();

    while !rest.is_empty() {
        let body = rest.strip_prefix("=?")?;
        let mut fields = body.splitn(3, '?');
        let charset = fields.next()?;
        let encoding = fields.next()?;
        let tail = fields.next()?;
        let end = tail.find("?=")?;
        let text = &tail[..end];

        let bytes = match encoding {
            "B" | "b" => decode_base64(text.as_bytes())?,
            "Q" | "q" => decode_q(text.as_bytes()),
            _ => return None,
        };

        // RFC 2231 allows a language after `*`: `utf-8*en`.
        let charset = charset.split('*').next().unwrap_or(charset);
        let encoding = Encoding::for_label(charset.as_bytes()).unwrap_or(UTF_8);
        out.push_str(&encoding.decode(&bytes).0);

        rest = tail[end + 2..].trim_start();
    }

    Some(out)
}

fn decode_q(text: &[u8]) -> Vec<u8> {
    let underscores: Vec<u8> = text.iter().map(|b| if *b == b'_' { b' ' } else { *b }).collect();
    let mut out = Vec::with_capacity(underscores.len());
    let mut i = 0;

    while i < underscores.len() {
        if underscores[i] == b'=' && i + 2 < underscores.len() {
            if let (Some(hi), Some(lo)) = (hex_value(underscores[i + 1]), hex_value(underscores[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(underscores[i]);
        i += 1;
    }

    out
}

fn decode_base64(text: &[u8]) -> Option<Vec<u8>> {
    fn sextet(b: u8) -> Option<u32> {
        match b {
            b'A'..=b'Z' => Some((b - b'A') as u32),
            b'a'..=b'z' => Some((b - b'a' + 26) as u32),
            b'0'..=b'9' => Some((b - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let text: Vec<u8> = text.iter().copied().filter(|b| *b != b'=').collect();
    let mut out = Vec::with_capacity(text.len() * 3 / 4);

    for chunk in text.chunks(4) {
        if chunk.len() == 1 {
            return None;
        }
        let mut acc = 0u32;
        for (i, b) in chunk.iter().enumerate() {
            acc |= sextet(*b)? << (18 - 6 * i);
        }
        let bytes = acc.to_be_bytes();
        out.extend_from_slice(&bytes[1..chunk.len()]);
    }

    Some(out)
}
