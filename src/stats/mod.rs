pub mod descriptive;
pub mod hypothesis;
pub mod tukey;

pub use descriptive::{
    calculate_comparative_variability, calculate_statistics, export_price_chart, format_variability_table,
    generate_analysis_report,
};
pub use hypothesis::{perform_anova_analysis, perform_hypothesis_test, run_anova_and_tukey};
