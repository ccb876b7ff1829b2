pub mod bitset; // packed bit sets and contiguous signature arenas
pub mod error; // container error kinds
pub mod mapped_vector; // file-backed fixed-layout vector
pub mod string_table; // open-addressing string interning
pub mod vector_of_vectors; // jagged vector with table of contents

pub use bitset::{BitSet, SignatureArena};
pub use error::MapError;
pub use mapped_vector::MappedVector;
pub use string_table::{StringTable, INVALID_STRING_ID};
pub use vector_of_vectors::VectorOfVectors;
