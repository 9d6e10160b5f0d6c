use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

/// Anything that can cross the fabric: postcard-encoded, owned, debuggable.
pub trait Wire: Serialize + DeserializeOwned + Debug + Send + 'static {
    fn to_bytes(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("postcard::to_stdvec is infallible")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

impl<T: Serialize + DeserializeOwned + Debug + Send + 'static> Wire for T {}
