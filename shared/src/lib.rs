#![cfg_attr(not(feature = "std"), no_std)]

pub mod errors;
pub mod flags;
pub mod layout;
pub mod ring;
