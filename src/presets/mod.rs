//! # Presets
//!
//! Ready-made fixtures for common backing services.

pub mod elasticsearch;
pub mod postgres;
pub mod rabbitmq;

pub use elasticsearch::ElasticsearchPreset;
pub use postgres::PostgresPreset;
pub use rabbitmq::RabbitMqPreset;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters kept verbatim in URL user info and path segments
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode one URL component (user, password, database, vhost)
pub(crate) fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URL_COMPONENT).to_string()
}
