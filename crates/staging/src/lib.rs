//! 文件暂存：规则表、归约流水线和任务脚本生成

pub mod call;
pub mod quoting;
pub mod reducer;
pub mod rules;
pub mod script;
pub mod substitution;

pub use reducer::{FilterReducer, Fragment, Reducer, ReducerPipeline, RuleReducer, SubstitutionReducer};
pub use rules::{DirectiveVerb, Rule, RuleKey, RuleTable, ShellTemplate, StagingDirective, Translation};
pub use script::{ScriptBuilder, TaskScript};
pub use substitution::DriveMap;
