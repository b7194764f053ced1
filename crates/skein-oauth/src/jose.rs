pub mod jws;
pub mod jwt;
pub mod signing;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Header {
    Jws(jws::Header),
}

pub use self::signing::create_signed_jwt;
