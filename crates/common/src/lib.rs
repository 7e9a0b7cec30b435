// tandem-common: shared wire protocol types for the Tandem workspace

pub mod change;
pub mod lock;
pub mod presence;
pub mod protocol;
