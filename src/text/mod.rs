pub mod glossary;
pub mod mask;
pub mod postfix;
pub mod split;

pub use glossary::{apply_glossary, GlossaryApplication};
pub use mask::{mask, unmask, MaskedText};
pub use postfix::apply_post_fixers;
pub use split::split_long_text;
