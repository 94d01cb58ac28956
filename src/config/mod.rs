mod probe_group;
mod settings;

pub use probe_group::*;
pub use settings::*;
