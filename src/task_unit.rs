//! File Task Unit: render every fragment of one input document and persist
//! exactly one cache record for it.

use crate::cache::{
    CacheEntry, CachePayload, CacheRecord, CacheStore, FailedPayload, FragmentError, RenderedFragment,
    RenderedPayload, SkippedFragment, cache_key,
};
use crate::markup;
use crate::render::{Render, RenderInvoker};
use crate::types::{
    FailureKind, FileFailure, FileOutcome, FragmentKind, FragmentOutcome, RunConfig, Task,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const PREVIEW_CHARS: usize = 200;
const SKIP_REASON: &str = "pure_newcommand_or_empty";

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    display_formulas: Vec<Fragment>,
    #[serde(default)]
    inline_texts: Vec<Fragment>,
    #[serde(default)]
    tables: Vec<Fragment>,
}

impl Document {
    fn fragments(&self, kind: FragmentKind) -> &[Fragment] {
        match kind {
            FragmentKind::Formula => &self.display_formulas,
            FragmentKind::Text => &self.inline_texts,
            FragmentKind::Table => &self.tables,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Fragment {
    #[serde(default)]
    content: String,
}

/// Worker entry point: build the renderer and store from the task's own
/// configuration, then process.
pub fn run_task(task: &Task) -> FileOutcome {
    let setup = CacheStore::open(&task.config.cache_dir)
        .and_then(|store| Ok((store, RenderInvoker::from_config(&task.config)?)));

    match setup {
        Ok((store, invoker)) => process(task, &invoker, &store),
        Err(e) => {
            error!(file = %task.input.display(), error = %format!("{e:#}"), "cannot set up file task");
            FileOutcome::failed(
                task.input.clone(),
                FileFailure {
                    error_type: "SetupError".to_string(),
                    error_message: format!("{e:#}"),
                },
            )
        }
    }
}

/// Render one file. Never fails: a document that cannot be loaded becomes a
/// `status: failed` record instead.
pub fn process<R: Render>(task: &Task, renderer: &R, store: &CacheStore) -> FileOutcome {
    info!(file = %task.input.display(), kinds = ?task.config.kinds, "processing file");

    match render_document(task, renderer) {
        Ok(payload) => {
            let stats = payload.stats.clone();
            store.write(&task.input, CacheEntry::now(CachePayload::Ok(payload)));
            FileOutcome::succeeded(task.input.clone(), stats)
        }
        Err(e) => {
            let error_type = error_type_name(&e);
            error!(
                file = %task.input.display(),
                error_type,
                error = %format!("{e:#}"),
                "file processing failed"
            );
            store.write(
                &task.input,
                CacheEntry::now(CachePayload::Failed(FailedPayload {
                    error: format!("{e:#}"),
                    error_type: error_type.to_string(),
                    error_traceback: format!("{e:?}"),
                    file_path: task.input.to_string_lossy().into_owned(),
                })),
            );
            FileOutcome::failed(
                task.input.clone(),
                FileFailure {
                    error_type: error_type.to_string(),
                    error_message: format!("{e:#}"),
                },
            )
        }
    }
}

fn render_document<R: Render>(task: &Task, renderer: &R) -> Result<RenderedPayload> {
    let documents = load_documents(&task.input)?;
    let cfg = &task.config;
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("create output dir {}", cfg.output_dir.display()))?;

    let prefix = cache_key(&task.input);
    let mut payload = RenderedPayload::default();

    for (doc_idx, doc) in documents.iter().enumerate() {
        let document_index = doc_idx + 1;
        debug!(document_index, total = documents.len(), "processing document");

        for kind in FragmentKind::ALL {
            if !cfg.kinds.includes(kind) {
                continue;
            }
            for (i, fragment) in doc.fragments(kind).iter().enumerate() {
                let item_index = i + 1;
                let output = output_path(cfg, &prefix, document_index, kind, item_index);
                let outcome = render_fragment(renderer, cfg, &fragment.content, kind, &output);
                record(&mut payload, outcome, kind, document_index, item_index);
            }
        }
    }

    Ok(payload)
}

fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

    // Anything other than a list of documents holds nothing to render.
    let serde_json::Value::Array(items) = value else {
        warn!(file = %path.display(), "input is not a list of documents");
        return Ok(Vec::new());
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .with_context(|| format!("document {} in {} is malformed", i + 1, path.display()))
        })
        .collect()
}

/// `<output_dir>/<key>_doc001_formula_001.png`. The key prefix keeps equal
/// stems from different directories apart.
pub fn output_path(
    cfg: &RunConfig,
    prefix: &str,
    document_index: usize,
    kind: FragmentKind,
    item_index: usize,
) -> PathBuf {
    cfg.output_dir.join(format!(
        "{}_doc{:03}_{}_{:03}.png",
        prefix,
        document_index,
        kind.as_str(),
        item_index
    ))
}

fn render_fragment<R: Render>(
    renderer: &R,
    cfg: &RunConfig,
    content: &str,
    kind: FragmentKind,
    output: &Path,
) -> FragmentOutcome {
    if content.trim().is_empty() || markup::is_pure_definition(content) {
        return FragmentOutcome::Skipped {
            content: content.to_string(),
            reason: SKIP_REASON.to_string(),
        };
    }

    match renderer.render(content, kind, output, cfg.dpi) {
        Ok(image) => FragmentOutcome::Rendered {
            content: content.to_string(),
            image,
        },
        Err(failure) => FragmentOutcome::Failed {
            content: content.to_string(),
            kind: failure.kind,
            message: failure.message,
        },
    }
}

fn record(
    payload: &mut RenderedPayload,
    outcome: FragmentOutcome,
    kind: FragmentKind,
    document_index: usize,
    item_index: usize,
) {
    match outcome {
        FragmentOutcome::Rendered { content, image } => {
            payload.stats.record_rendered(kind);
            payload.output_files.push(
                kind,
                RenderedFragment {
                    content,
                    image: image.to_string_lossy().into_owned(),
                    document_index,
                },
            );
        }
        FragmentOutcome::Skipped { content, reason } => {
            debug!(document_index, item_index, %kind, "skipping definition-only fragment");
            payload.stats.skipped_count += 1;
            payload.skipped.push(SkippedFragment {
                error_type: "ContentSkipped".to_string(),
                skip_reason: reason,
                content_preview: preview(&content),
                item_index,
                item_type: kind.item_type().to_string(),
                document_index,
            });
        }
        FragmentOutcome::Failed {
            content,
            kind: failure,
            message,
        } => {
            let error_type = match failure {
                FailureKind::RenderingError => markup::classify_error(&message).to_string(),
                other => other.to_string(),
            };
            warn!(
                document_index,
                item_index,
                %kind,
                error_type = %error_type,
                source_error_type = %failure,
                "fragment failed"
            );
            payload.stats.errors_count += 1;
            payload.errors.push(FragmentError {
                error_message: format!(
                    "document {document_index} {kind} {item_index} failed: {message}"
                ),
                error_type,
                source_error_type: failure.to_string(),
                content_preview: preview(&content),
                item_index,
                item_type: kind.item_type().to_string(),
                document_index,
            });
        }
    }
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

fn error_type_name(err: &anyhow::Error) -> &'static str {
    if err.chain().any(|c| c.is::<serde_json::Error>()) {
        "JsonError"
    } else if err.chain().any(|c| c.is::<std::io::Error>()) {
        "IoError"
    } else {
        "DocumentError"
    }
}

/// In-process single-file run, used by the `render` command. Returns the
/// record as written back by the store.
pub fn render_single(task: &Task) -> Result<(FileOutcome, Option<CacheRecord>)> {
    let store = CacheStore::open(&task.config.cache_dir)?;
    let invoker = RenderInvoker::from_config(&task.config)?;
    let outcome = process(task, &invoker, &store);
    Ok((outcome, store.read(&task.input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderFailure;
    use crate::types::KindFilter;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Records every call; content decides the outcome.
    #[derive(Default)]
    struct FakeRenderer {
        calls: RefCell<Vec<(String, FragmentKind, PathBuf)>>,
    }

    impl Render for FakeRenderer {
        fn render(
            &self,
            content: &str,
            kind: FragmentKind,
            output: &Path,
            _dpi: u32,
        ) -> Result<PathBuf, RenderFailure> {
            self.calls
                .borrow_mut()
                .push((content.to_string(), kind, output.to_path_buf()));
            if content.contains("\\undefined") {
                Err(RenderFailure {
                    kind: FailureKind::RenderingError,
                    message: "! Undefined control sequence.".into(),
                })
            } else if content.contains("hang") {
                Err(RenderFailure {
                    kind: FailureKind::Timeout,
                    message: "renderer exceeded 30.0s".into(),
                })
            } else {
                Ok(output.to_path_buf())
            }
        }
    }

    fn task(dir: &TempDir, name: &str, body: &str, kinds: KindFilter) -> Task {
        let input = dir.path().join(name);
        std::fs::write(&input, body).unwrap();
        Task {
            input,
            config: RunConfig {
                output_dir: dir.path().join("out"),
                cache_dir: dir.path().join("cache"),
                dpi: 300,
                kinds,
                renderer: vec!["unused".into()],
                render_timeout_secs: 30,
                blank_pixel_threshold: 100,
            },
        }
    }

    const DOC: &str = r#"[
        {
            "display_formulas": [{"content": "$$a^2$$"}, {"content": "\\undefined{x}"}],
            "inline_texts": [{"content": "\\newcommand{\\x}{1}"}, {"content": "text $x$"}],
            "tables": [{"content": "\\begin{tabular}{c} a \\end{tabular}"}]
        },
        {
            "display_formulas": [{"content": "hang"}],
            "inline_texts": [{"content": "   "}]
        }
    ]"#;

    #[test]
    fn classifies_every_fragment_and_writes_one_record() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "paper.json", DOC, KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();
        let renderer = FakeRenderer::default();

        let outcome = process(&t, &renderer, &store);
        assert!(outcome.success);
        assert_eq!(outcome.stats.formulas_count, 1);
        assert_eq!(outcome.stats.texts_count, 1);
        assert_eq!(outcome.stats.tables_count, 1);
        assert_eq!(outcome.stats.errors_count, 2);
        assert_eq!(outcome.stats.skipped_count, 2);

        // skipped fragments never reach the renderer
        assert_eq!(renderer.calls.borrow().len(), 5);

        let records = store.list();
        assert_eq!(records.len(), 1);
        let CachePayload::Ok(payload) = &records[0].payload else {
            panic!("expected a success record");
        };
        assert_eq!(payload.stats, outcome.stats);

        let undefined = &payload.errors[0];
        assert_eq!(undefined.error_type, "UndefinedCommand");
        assert_eq!(undefined.source_error_type, "RenderingError");
        assert_eq!((undefined.document_index, undefined.item_index), (1, 2));
        assert_eq!(undefined.item_type, "display_formula");

        let hung = &payload.errors[1];
        assert_eq!(hung.error_type, "Timeout");
        assert_eq!(hung.source_error_type, "Timeout");
        assert_eq!(hung.document_index, 2);

        assert_eq!(payload.skipped[0].error_type, "ContentSkipped");
        assert_eq!(payload.skipped[0].item_type, "inline_text");
    }

    #[test]
    fn fragments_are_visited_in_document_order() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "paper.json", DOC, KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();
        let renderer = FakeRenderer::default();
        process(&t, &renderer, &store);

        let key = cache_key(&t.input);
        let names: Vec<String> = renderer
            .calls
            .borrow()
            .iter()
            .map(|(_, _, p)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                format!("{key}_doc001_formula_001.png"),
                format!("{key}_doc001_formula_002.png"),
                format!("{key}_doc001_text_002.png"),
                format!("{key}_doc001_table_001.png"),
                format!("{key}_doc002_formula_001.png"),
            ]
        );
    }

    #[test]
    fn kind_filter_limits_rendering() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "paper.json", DOC, KindFilter::Table);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();
        let renderer = FakeRenderer::default();

        let outcome = process(&t, &renderer, &store);
        assert_eq!(outcome.stats.tables_count, 1);
        assert_eq!(outcome.stats.attempted(), 1);
        assert!(renderer.calls.borrow().iter().all(|(_, k, _)| *k == FragmentKind::Table));
    }

    #[test]
    fn malformed_document_becomes_failed_record() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "broken.json", "[{\"display_formulas\": [", KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();

        let outcome = process(&t, &FakeRenderer::default(), &store);
        assert!(!outcome.success);
        assert_eq!(outcome.failure.as_ref().unwrap().error_type, "JsonError");
        assert_eq!(outcome.stats.errors_count, 1);

        let rec = store.read(&t.input).unwrap();
        let CachePayload::Failed(failed) = rec.payload else {
            panic!("expected a failure record");
        };
        assert_eq!(failed.error_type, "JsonError");
        assert!(!failed.error_traceback.is_empty());
    }

    #[test]
    fn missing_file_becomes_failed_record() {
        let dir = TempDir::new().unwrap();
        let mut t = task(&dir, "present.json", "[]", KindFilter::All);
        t.input = dir.path().join("gone.json");
        let store = CacheStore::open(&t.config.cache_dir).unwrap();

        let outcome = process(&t, &FakeRenderer::default(), &store);
        assert_eq!(outcome.failure.unwrap().error_type, "IoError");
        assert!(store.read(&t.input).unwrap().payload.is_failed());
    }

    #[test]
    fn wrong_document_shape_is_a_file_failure() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "odd.json", r#"[{"display_formulas": 5}]"#, KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();

        let outcome = process(&t, &FakeRenderer::default(), &store);
        assert!(!outcome.success);
    }

    #[test]
    fn non_list_input_has_nothing_to_render() {
        let dir = TempDir::new().unwrap();
        let t = task(&dir, "obj.json", r#"{"display_formulas": []}"#, KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();

        let outcome = process(&t, &FakeRenderer::default(), &store);
        assert!(outcome.success);
        assert_eq!(outcome.stats.attempted(), 0);
        assert!(!store.read(&t.input).unwrap().payload.is_failed());
    }

    #[test]
    fn all_failures_still_produce_a_record() {
        let dir = TempDir::new().unwrap();
        let body = r#"[{"display_formulas": [{"content": "hang"}, {"content": "hang again"}]}]"#;
        let t = task(&dir, "slow.json", body, KindFilter::All);
        let store = CacheStore::open(&t.config.cache_dir).unwrap();

        let outcome = process(&t, &FakeRenderer::default(), &store);
        assert!(outcome.success);
        assert_eq!(outcome.stats.errors_count, 2);
        assert!(store.has(&t.input));
    }
}
