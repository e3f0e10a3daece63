mod conductor;
mod node;
mod port;

pub use conductor::*;
pub use node::*;
pub use port::*;

use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;
