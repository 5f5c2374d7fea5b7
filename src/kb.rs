//! Knowledge-base discovery.
//!
//! Walks the configured root, filters files with include/exclude globs
//! matched against the path relative to the root, and reads each file as
//! one [`SourceDocument`]. The document id is the relative path without
//! its extension, always `/`-separated, so `billing/refunds.md` becomes
//! `billing/refunds`.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use support_harness_core::models::SourceDocument;

use crate::config::KnowledgeBaseConfig;

pub fn scan_knowledge_base(kb: &KnowledgeBaseConfig) -> Result<Vec<SourceDocument>> {
    let root = &kb.root;
    if !root.exists() {
        bail!("Knowledge base root does not exist: {}", root.display());
    }

    let include_set = build_globset(&kb.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(kb.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    for entry in WalkDir::new(root).follow_links(kb.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push(SourceDocument::new(document_id(relative), text));
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!(root = %root.display(), documents = documents.len(), "scanned knowledge base");

    Ok(documents)
}

fn document_id(relative: &Path) -> String {
    relative
        .with_extension("")
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn kb_config(root: PathBuf) -> KnowledgeBaseConfig {
        KnowledgeBaseConfig {
            root,
            ..KnowledgeBaseConfig::default()
        }
    }

    #[test]
    fn test_scan_reads_markdown_sorted() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("billing")).unwrap();
        std::fs::write(tmp.path().join("billing/refunds.md"), "Refunds take 5 days.").unwrap();
        std::fs::write(tmp.path().join("account.md"), "Reset your password.").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let docs = scan_knowledge_base(&kb_config(tmp.path().to_path_buf())).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["account", "billing/refunds"]);
        assert_eq!(docs[0].text, "Reset your password.");
    }

    #[test]
    fn test_scan_applies_excludes() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        std::fs::write(tmp.path().join("drafts/wip.md"), "draft").unwrap();
        std::fs::write(tmp.path().join("node_modules/pkg/README.md"), "vendored").unwrap();
        std::fs::write(tmp.path().join("faq.md"), "faq").unwrap();

        let mut config = kb_config(tmp.path().to_path_buf());
        config.exclude_globs = vec!["drafts/**".to_string()];

        let docs = scan_knowledge_base(&config).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "faq");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = scan_knowledge_base(&kb_config(tmp.path().join("nope")));
        assert!(result.is_err());
    }
}
