#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod error;
pub mod faer_ndarray;
pub mod lcurve;
pub mod operators;
pub mod solver;
pub mod stdform;
pub mod workspace;

pub use error::FitError;
pub use lcurve::{lcurve, lcurve_corner, lcurve_corner_squared, reg_param_grid};
pub use operators::{MAX_DIFF_ORDER, difference_operator, sobolev_operator};
pub use solver::{SolveOutcome, solve_regularized, svd_balanced, svd_standard_form};
pub use stdform::{
    from_standard_form_diag, from_standard_form_general, to_standard_form_diag,
    to_standard_form_diag_in_place, to_standard_form_general,
};
pub use workspace::FitWorkspace;
