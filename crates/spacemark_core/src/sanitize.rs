use percent_encoding::percent_decode_str;
use unicode_normalization::UnicodeNormalization;

pub const FALLBACK_NAME: &str = "unnamed";
const MAX_NAME_CHARS: usize = 180;
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turns a raw title into a filesystem-safe file stem.
pub fn sanitize_name(raw: &str, use_underscore: bool) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let normalized = decoded.nfkc().collect::<String>();

    let mut output = String::with_capacity(normalized.len());
    let mut previous_space = false;
    for ch in normalized.chars() {
        if is_invisible(ch) {
            continue;
        }
        let mapped = if is_invalid_filename_char(ch) {
            '-'
        } else if ch.is_whitespace() {
            ' '
        } else {
            ch
        };
        if mapped == ' ' {
            if previous_space || output.is_empty() {
                continue;
            }
            previous_space = true;
        } else {
            previous_space = false;
        }
        output.push(mapped);
    }

    let mut output = output.replace(". ", " ");
    while output.ends_with('.') || output.ends_with(' ') {
        output.pop();
    }
    if use_underscore {
        output = output.replace(' ', "_");
    }
    if output.chars().count() > MAX_NAME_CHARS {
        output = output.chars().take(MAX_NAME_CHARS).collect();
        output = output.trim_end_matches(['.', ' ', '_']).to_string();
    }
    if output.trim_matches(['-', '_', ' ']).is_empty() {
        return FALLBACK_NAME.to_string();
    }
    let stem = output.split('.').next().unwrap_or("").to_ascii_uppercase();
    if RESERVED_DEVICE_NAMES.contains(&stem.as_str()) {
        output.insert(0, '_');
    }
    output
}

/// Sanitizes a file name while keeping its extension intact.
pub fn sanitize_file_name(raw: &str) -> String {
    match raw.rsplit_once('.') {
        Some((stem, extension))
            if !stem.is_empty()
                && !extension.is_empty()
                && extension.len() <= 8
                && extension.chars().all(|ch| ch.is_ascii_alphanumeric()) =>
        {
            format!(
                "{}.{}",
                sanitize_name(stem, false),
                extension.to_ascii_lowercase()
            )
        }
        _ => sanitize_name(raw, false),
    }
}

fn is_invalid_filename_char(ch: char) -> bool {
    matches!(
        ch,
        '+' | '/' | '\\' | ':' | '*' | '?' | '&' | '"' | '<' | '>' | '|' | '^' | '[' | ']' | '#'
    )
}

fn is_invisible(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
    ) || ('\u{E000}'..='\u{F8FF}').contains(&ch)
        || (ch.is_control() && !ch.is_whitespace())
}
