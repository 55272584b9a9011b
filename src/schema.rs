use std::fs;
use std::path::Path;

use anyhow::Error;
use schemars::{JsonSchema, schema_for};

use crate::flow::manager::{ExecutionRecord, StartRequest};
use crate::flow::state::FlowRunReport;
use crate::graph::{FlowDocument, NodeKind};
use crate::nodes::{
    collector::CollectorConfig, command::CommandConfig, conditional::ConditionalConfig,
    counter::CounterConfig, database::DatabaseQueryConfig, file::FileConfig, format::FormatConfig,
    http::HttpConfig, iterator::IteratorConfig, parser::ParserConfig, prompt::PromptConfig,
    rss::RssConfig, test_node::TestConfig, text_display::TextDisplayConfig,
};

fn write<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<(), Error> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    Ok(())
}

/// Write JSON Schemas for the flow document, the execution types and every
/// node's `data` object (`node-<type>.schema.json`).
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    write::<FlowDocument>(out_dir, "flow")?;
    write::<StartRequest>(out_dir, "start-request")?;
    write::<ExecutionRecord>(out_dir, "execution")?;
    write::<FlowRunReport>(out_dir, "run-report")?;

    for kind in NodeKind::ALL {
        let name = format!("node-{kind}");
        match kind {
            NodeKind::Http => write::<HttpConfig>(out_dir, &name)?,
            NodeKind::Format => write::<FormatConfig>(out_dir, &name)?,
            NodeKind::File => write::<FileConfig>(out_dir, &name)?,
            NodeKind::Parser => write::<ParserConfig>(out_dir, &name)?,
            NodeKind::Conditional => write::<ConditionalConfig>(out_dir, &name)?,
            NodeKind::Iterator => write::<IteratorConfig>(out_dir, &name)?,
            NodeKind::Test => write::<TestConfig>(out_dir, &name)?,
            NodeKind::Command => write::<CommandConfig>(out_dir, &name)?,
            NodeKind::DatabaseQuery => write::<DatabaseQueryConfig>(out_dir, &name)?,
            NodeKind::Rss => write::<RssConfig>(out_dir, &name)?,
            NodeKind::Prompt => write::<PromptConfig>(out_dir, &name)?,
            NodeKind::Counter => write::<CounterConfig>(out_dir, &name)?,
            NodeKind::TextDisplay => write::<TextDisplayConfig>(out_dir, &name)?,
            NodeKind::Collector => write::<CollectorConfig>(out_dir, &name)?,
        }
    }

    let mut written: Vec<String> = fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".schema.json"))
        .collect();
    written.sort();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writes_flow_and_node_schemas() {
        let dir = tempdir().unwrap();
        let written = write_schema(dir.path()).unwrap();
        assert_eq!(written.len(), 4 + NodeKind::ALL.len());
        assert!(written.contains(&"node-database_query.schema.json".to_string()));

        let flow: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("flow.schema.json")).unwrap()).unwrap();
        assert_eq!(flow["title"], serde_json::json!("FlowDocument"));
    }
}
