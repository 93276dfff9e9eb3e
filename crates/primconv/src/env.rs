use std::env;
use std::sync::OnceLock;

use crate::nn::layers::conv::EngineKind;

static PRIMCONV_ENGINE: OnceLock<Option<EngineKind>> = OnceLock::new();
static PRIMCONV_LIBRARY: OnceLock<Option<String>> = OnceLock::new();

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn parse_engine(value: &str) -> Option<EngineKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "reference" | "ref" => Some(EngineKind::Reference),
        "accelerated" | "primitive" => Some(EngineKind::Accelerated),
        _ => None,
    }
}

/// Engine forced through `PRIMCONV_ENGINE`, read once per process.
pub(crate) fn engine_override() -> Option<EngineKind> {
    *PRIMCONV_ENGINE.get_or_init(|| {
        let value = non_empty("PRIMCONV_ENGINE")?;
        let parsed = parse_engine(&value);
        if parsed.is_none() {
            tracing::warn!(value = %value, "ignoring unrecognized PRIMCONV_ENGINE");
        }
        parsed
    })
}

/// Library name forced through `PRIMCONV_LIBRARY`, read once per process.
pub(crate) fn library_override() -> Option<&'static str> {
    PRIMCONV_LIBRARY
        .get_or_init(|| non_empty("PRIMCONV_LIBRARY"))
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names_are_case_insensitive() {
        assert_eq!(parse_engine(" Accelerated "), Some(EngineKind::Accelerated));
        assert_eq!(parse_engine("REF"), Some(EngineKind::Reference));
        assert_eq!(parse_engine("gpu"), None);
    }

    #[test]
    fn only_the_documented_engine_names_are_accepted() {
        assert_eq!(parse_engine("primitive"), Some(EngineKind::Accelerated));
        assert_eq!(parse_engine("reference"), Some(EngineKind::Reference));
        for vendor in ["caffe", "mkl", "mkl2017", "cudnn"] {
            assert_eq!(parse_engine(vendor), None, "{vendor}");
        }
    }
}
