//! Configuration parameters struct parsing helper.

/// Builds a tuning struct: starts from `Default`, then applies the listed
/// fields found in an optional TOML string. A key that is not listed, a
/// value of the wrong type, or malformed TOML yields `Err(LendsetError)`.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => ReplicaConfig;
///                             poll_timeout_ms, require_acks)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;
        (|| -> Result<$config_type, $crate::LendsetError> {
            let mut config = <$config_type>::default();
            if let Some(text) = config_str {
                let mut knobs: toml::Table = text.parse()?;
                $(
                    if let Some(value) = knobs.remove(stringify!($field)) {
                        config.$field = value.try_into()?;
                    }
                )+
                // leftovers name no known field
                if let Some(knob) = knobs.keys().next() {
                    return Err($crate::LendsetError::msg(format!(
                        "unknown config knob '{}'",
                        knob
                    )));
                }
            }
            Ok(config)
        })()
    }};
}
