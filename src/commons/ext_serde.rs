//! Helper methods for serializing and deserializing external types.

use std::str::FromStr;

use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

pub fn ser_level_filter<S>(level: &LevelFilter, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    level.to_string().serialize(s)
}
