use crate::error::CodecError;

/// Renders a vector as a pgvector literal: `[0.1,-0.25,3]`.
///
/// `f32`'s `Display` is the shortest representation that parses back to the
/// same bits and never depends on locale.
pub fn encode_vector(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 12 + 2);
    out.push('[');
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

pub fn decode_vector(literal: &str) -> Result<Vec<f32>, CodecError> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|value| value.strip_suffix(']'))
        .ok_or(CodecError::MissingBrackets)?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::<f32>::new();
    for (index, raw) in inner.split(',').enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CodecError::EmptyComponent(index));
        }

        let value = raw
            .parse::<f32>()
            .map_err(|_| CodecError::InvalidComponent {
                index,
                raw: raw.to_string(),
            })?;
        if !value.is_finite() {
            return Err(CodecError::NonFinite(index));
        }
        out.push(value);
    }

    Ok(out)
}
