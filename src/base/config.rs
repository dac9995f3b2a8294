use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use toml::Value;

/// A TOML-backed configuration section. A missing section falls back to the defaults.
pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .with_context(|| format!("cannot deserialize {}", std::any::type_name::<Self>())),
            None => {
                warn!("config section for {} not found", std::any::type_name::<Self>());
                Ok(Self::default())
            }
        }
    }
}

impl<T> Config for Vec<T> where T: DeserializeOwned {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default, PartialEq)]
    #[serde(default)]
    struct Knobs {
        depth: u32,
        name: String,
    }

    impl Config for Knobs {}

    #[test]
    fn missing_section_uses_defaults() {
        assert_eq!(Knobs::default(), Knobs::from_section(None).unwrap());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let table: Value = toml::from_str("depth = 4").unwrap();
        let knobs = Knobs::from_section(Some(&table)).unwrap();
        assert_eq!(4, knobs.depth);
        assert_eq!("", knobs.name);
    }

    #[test]
    fn bad_type_is_an_error() {
        let table: Value = toml::from_str("depth = \"deep\"").unwrap();
        assert!(Knobs::from_section(Some(&table)).is_err());
    }
}
