#![allow(dead_code)]

pub use flowmgr_test_utils::builders;
pub use flowmgr_test_utils::{init_tracing, query, wait_for_status, with_timeout};

use flowmgr::process::Process;
use flowmgr_test_utils::builders::ProcessBuilder;

/// `reads`: no inputs, one `fastq` output.
pub fn reads_process() -> Process {
    ProcessBuilder::new("reads", "echo reads")
        .output("fastq", "file")
        .build()
}

/// `align`: consumes the `fastq` output of a `reads` data object.
pub fn align_process() -> Process {
    ProcessBuilder::new("align", "align {{ reads.fastq | quote }}")
        .input("reads", "data")
        .resource_class("heavy")
        .build()
}

/// `sleep`: takes a duration, produces nothing.
pub fn sleep_process() -> Process {
    ProcessBuilder::new("sleep", "sleep {{ seconds }}")
        .input("seconds", "integer")
        .build()
}

/// `upper`: upper-cases `text` into the `text` output.
pub fn upper_process() -> Process {
    ProcessBuilder::new("upper", "echo {{ text | quote }} | tr a-z A-Z")
        .input("text", "string")
        .output("text", "string")
        .build()
}

/// `word-count`: counts the words of another object's `text` output.
pub fn word_count_process() -> Process {
    ProcessBuilder::new("word-count", "wc -w {{ source.text | quote }}")
        .input("source", "data")
        .output("count", "integer")
        .build()
}

/// `shout-and-count`: runs `upper`, then `word-count` on its result.
pub fn shout_and_count_workflow() -> Process {
    ProcessBuilder::workflow("shout-and-count")
        .input("text", "string")
        .step("shout", "upper", serde_json::json!({ "text": "{{ text }}" }))
        .step("count", "word-count", serde_json::json!({ "source": "@shout" }))
        .build()
}
