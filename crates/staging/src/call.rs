//! 函数调用任务的文件格式
//!
//! 调用方写入 `input.json`，远端由固定的两行引导脚本读取、执行并写回 `output.json`。

use serde::Serialize;
use taskyard_core::models::CallSpec;
use taskyard_core::{SchedulerError, SchedulerResult};

use crate::quoting::shell_quote;

pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const BOOTSTRAP_FILE: &str = "_bootstrap.py";

pub const BOOTSTRAP: &str = "import json, importlib; s = json.load(open('input.json')); m, _, f = s['function'].rpartition('.')\n\
json.dump(getattr(importlib.import_module(m), f)(*s['args'], **s['kwargs']), open('output.json', 'w'))\n";

#[derive(Serialize)]
struct CallInput<'a> {
    function: &'a str,
    args: &'a [serde_json::Value],
    kwargs: &'a serde_json::Map<String, serde_json::Value>,
}

pub fn input_json(call_spec: &CallSpec) -> SchedulerResult<String> {
    if !call_spec.function.contains('.') {
        return Err(SchedulerError::InvalidAction(format!(
            "调用目标必须是 module.function 形式: {}",
            call_spec.function
        )));
    }
    let input = CallInput {
        function: &call_spec.function,
        args: &call_spec.args,
        kwargs: &call_spec.kwargs,
    };
    Ok(serde_json::to_string_pretty(&input)?)
}

/// 解析远端写回的返回值
pub fn parse_output(text: &str) -> SchedulerResult<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| {
        SchedulerError::TaskExecution(format!("无法解析 {OUTPUT_FILE}: {e}"))
    })
}

pub fn main_command(interpreter: &str) -> String {
    format!("{} {BOOTSTRAP_FILE}", shell_quote(interpreter))
}
