pub mod concat;
pub mod handlers;
pub mod qrec;
pub mod qtype;
pub mod quantizer;
pub mod stats;

pub use handlers::HandlerRegistry;
pub use qrec::{QRec, QuantizationTable};
pub use qtype::{QScheme, QType};
pub use quantizer::Quantizer;
pub use stats::{NodeStats, Range, StatsTable};
