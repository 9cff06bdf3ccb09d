mod parsing;
mod settings;
mod types;

pub(crate) use types::{S3Settings, Settings, SqsSettings, TopicSettings};
