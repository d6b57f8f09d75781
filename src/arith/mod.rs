//! Ring arithmetic for the reference CKKS backend.
//!
//! This module provides the number-theoretic building blocks the RNS backend
//! is assembled from, allowing the backend code to stay at the level of
//! ciphertext operations.
//!
//! # Architecture
//!
//! - **[`modular`]**: word-sized modular arithmetic, primality testing and
//!   NTT-friendly prime generation
//! - **[`ntt`]**: negacyclic number-theoretic transform over one prime
//! - **[`rns`]**: polynomials in residue-number-system form over a modulus chain
//! - **[`sampling`]**: secret, error and uniform polynomial samplers
//! - **[`lagrange`]**: Lagrange weights for Shamir reconstruction modulo a prime
//!
//! # Example
//!
//! ```rust
//! use ivs_fhe::arith::{RingContext, RnsPoly};
//!
//! let ring = RingContext::new(16, &[30, 30]).expect("ring");
//! let a = RnsPoly::from_signed(&ring, &[1, 2, 3], 2);
//! let b = RnsPoly::from_signed(&ring, &[0, 1], 2);
//! // (1 + 2x + 3x^2) * x = x + 2x^2 + 3x^3
//! let product = a.mul(&b, &ring).expect("same level");
//! assert_eq!(product.centered_limb(&ring, 0)[..4], [0, 1, 2, 3]);
//! ```

pub mod lagrange;
pub mod modular;
pub mod ntt;
pub mod rns;
pub mod sampling;

pub use lagrange::lagrange_weights_at_zero;
pub use ntt::NttTable;
pub use rns::{RingContext, RnsPoly};
