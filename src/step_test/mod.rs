//! Step-test calculations: actuator perturbation to displacement sensitivity and back.

mod calculator;

pub use calculator::{
    axis_sign, combine_step_test_results, compute_alignment_target_steps,
    compute_average_size_delta, compute_axis_step_test_result, get_axis_step_delta,
    ActuatorLimits, AxisStepTestResult, CombinedStepTest, StepTestSettings, StepToDisplacement,
    DEFAULT_DELTA_STEPS, MIN_SENSITIVITY,
};
