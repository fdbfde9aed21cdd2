//! Architecture-specific pieces of the signal core.
//!
//! Only x86-64 is supported: the signal frame layout, the red zone, the
//! XSAVE area probing and the byte-touch fault recovery are all tied to the
//! System V AMD64 ABI.

pub mod x86_64;
