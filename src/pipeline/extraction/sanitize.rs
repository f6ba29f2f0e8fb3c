/// Sanitize recognized text before passing it downstream.
///
/// Strips control characters and OCR debris, collapses runs of spaces,
/// keeps one line per transcription line, and preserves the punctuation
/// that appears in prescriptions (doses, ratios, units, dates).
pub fn sanitize_extracted_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || is_prescription_symbol(*c))
        .collect::<String>()
        .lines()
        .map(collapse_spaces)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_prescription_symbol(c: char) -> bool {
    matches!(
        c,
        '.' | ','
            | ';'
            | ':'
            | '-'
            | '/'
            | '('
            | ')'
            | '['
            | ']'
            | '+'
            | '='
            | '%'
            | '#'
            | '@'
            | '&'
            | '\''
            | '"'
            | '!'
            | '?'
            | '<'
            | '>'
            | '*'
            | '_'
            | '°'
            | '²'
            | '³'
            | 'µ'
            | '℞'
            | '×'
            | '\u{2013}' // en dash
            | '\u{2019}' // right single quote
    )
}

fn collapse_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Locate the JSON object in a model response.
///
/// Vision models wrap JSON in ```json fences or surround it with prose.
/// Returns the outermost `{...}` span, preferring a fenced block.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let body = match response.find("```json") {
        Some(start) => {
            let content = &response[start + 7..];
            match content.find("```") {
                Some(end) => &content[..end],
                None => content,
            }
        }
        None => response,
    };
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    if close < open {
        return None;
    }
    Some(&body[open..=close])
}
