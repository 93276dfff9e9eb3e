//! Conformance suite every primitive library must pass.
//!
//! Library crates instantiate it with [`define_library_tests!`], handing over a
//! constructor that returns a fresh library per test.

pub mod suite;

#[macro_export]
macro_rules! define_library_tests {
    ($module:ident, $library_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::suite;

            macro_rules! library_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let library = ($library_ctor)();
                        suite::$name(&library);
                    }
                };
            }

            library_test!(forward_matches_reference);
            library_test!(backward_matches_reference);
            library_test!(gradients_match_finite_differences);
            library_test!(reshape_with_same_shape_keeps_primitives);
            library_test!(batch_change_rebuilds_like_fresh_layer);
            library_test!(iter_size_accumulates_parameter_diffs);
            library_test!(parameter_updates_invalidate_converted_copies);
            library_test!(conversions_round_trip);
            library_test!(primitives_are_released_on_drop);
            library_test!(shape_mismatch_is_rejected);
            library_test!(legacy_capabilities_match_reference);
            library_test!(frozen_parameters_keep_their_diffs);
        }
    };
}
