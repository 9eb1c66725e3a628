//! Output post-processing: stop strings, reasoning blocks, normalization.

pub mod normalize;
pub mod reasoning;
pub mod stop_strings;

pub use normalize::{NormalizeOptions, OutputNormalizer, trim_stop_strings, trim_to_end_sentence};
pub use reasoning::{ReasoningParser, ReasoningSplit};
pub use stop_strings::StopStringBuilder;
