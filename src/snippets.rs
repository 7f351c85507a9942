//! Curated snippet collection and classification.
//!
//! `load-snippets` reads a mounted, read-only directory in three formats:
//! JSON arrays of `{title, description, code_snippet}`, Markdown files with
//! YAML front-matter and a fenced code block, and raw code files. Each
//! record is classified as an executable `snippet` or a prose `reference`,
//! which decides its domain tag in the long memory tier.
//!
//! `load-standards` reads a folder of coding-standard Markdown documents;
//! those always land under the `standards` domain.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::models::{SnippetItem, SnippetKind};

/// Raw code file extensions collected as whole snippets.
const CODE_EXTENSIONS: [&str; 2] = ["bsl", "1c"];

fn front_matter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\A---\s*\n(.*?)\n---\s*\n").expect("static pattern"))
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:bsl|1c)?\s*\n(.*?)```").expect("static pattern"))
}

fn first_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s+(.+)$").expect("static pattern"))
}

/// Collect snippets from a folder: code files and front-matter Markdown,
/// recursively. JSON files are handled separately by [`load_json_file`].
pub fn collect_from_folder(dir: &Path) -> Vec<SnippetItem> {
    let mut items = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name().into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if !raw.trim().is_empty() {
                    items.push(SnippetItem {
                        title: stem_of(path),
                        description: String::new(),
                        code: raw.trim().to_string(),
                    });
                }
            }
        } else if ext == "md" {
            if path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase() == "readme.md")
                .unwrap_or(false)
            {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(path) else {
                continue;
            };
            let (meta, body) = parse_front_matter(&raw);
            let Some(code) = extract_code_block(body) else {
                continue;
            };
            items.push(SnippetItem {
                title: meta.title.unwrap_or_else(|| stem_of(path)),
                description: meta.description.unwrap_or_default(),
                code,
            });
        }
    }
    items
}

/// Parse a JSON file holding an array of snippet records.
pub fn load_json_file(path: &Path) -> Result<Vec<SnippetItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let items: Vec<SnippetItem> = serde_json::from_str(&raw).with_context(|| {
        format!(
            "{} must be a JSON array of {{title, description, code_snippet}}",
            path.display()
        )
    })?;
    Ok(items)
}

/// Collect every snippet source under a directory: JSON files first, then
/// code and Markdown files.
pub fn collect_all(dir: &Path) -> Result<Vec<SnippetItem>> {
    let mut items = Vec::new();
    let mut json_files: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().to_lowercase() == "json")
                .unwrap_or(false)
        })
        .collect();
    json_files.sort();
    for json in json_files {
        items.extend(load_json_file(&json)?);
    }
    items.extend(collect_from_folder(dir));
    Ok(items)
}

/// Collect standards documents: every non-readme Markdown file becomes one
/// record whose body is the whole document.
pub fn collect_standards(dir: &Path) -> Vec<SnippetItem> {
    let mut items = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name().into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase() != "md")
            .unwrap_or(true)
        {
            continue;
        }
        if path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase() == "readme.md")
            .unwrap_or(false)
        {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(path) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        let title = first_heading_re()
            .captures(&raw)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| stem_of(path));
        items.push(SnippetItem {
            title,
            description: first_paragraph(&raw),
            code: raw.trim().to_string(),
        });
    }
    items
}

struct FrontMatter {
    title: Option<String>,
    description: Option<String>,
}

fn parse_front_matter(content: &str) -> (FrontMatter, &str) {
    let mut meta = FrontMatter {
        title: None,
        description: None,
    };
    let Some(captures) = front_matter_re().captures(content) else {
        return (meta, content);
    };
    for line in captures[1].lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '\'' || c == '"').trim();
        match key.trim().to_lowercase().as_str() {
            "title" => meta.title = Some(value.to_string()),
            "description" => meta.description = Some(value.to_string()),
            _ => {}
        }
    }
    let rest = &content[captures.get(0).map(|m| m.end()).unwrap_or(0)..];
    (meta, rest)
}

fn extract_code_block(body: &str) -> Option<String> {
    code_block_re()
        .captures(body)
        .map(|c| c[1].trim().to_string())
        .filter(|c| !c.is_empty())
}

fn first_paragraph(content: &str) -> String {
    let mut para: Vec<&str> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with('|') || line.starts_with('-') || line.is_empty()
        {
            if !para.is_empty() {
                break;
            }
            continue;
        }
        para.push(line);
        if para.iter().map(|l| l.len()).sum::<usize>() >= 200 {
            break;
        }
    }
    crate::models::truncate_chars(&para.join(" "), 300)
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snippet".to_string())
}

// ── Classification ──────────────────────────────────────────────────────

/// Language constructs that mark a body of text as executable code.
const CODE_MARKERS: [&str; 14] = [
    "Процедура",
    "Функция",
    "КонецПроцедуры",
    "КонецФункции",
    "Запрос",
    "Выполнить",
    "Новый ",
    "Возврат",
    "Цикл",
    "КонецЦикла",
    "Тогда",
    "КонецЕсли",
    "Попытка",
    "Исключение",
];

fn reference_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(как\s+|инструкция|руководство|настройка|восстановление|установка|методика|решение\s+проблемы|ошибка|how\s+to|troubleshooting|guide|setup)",
        )
        .expect("static pattern")
    })
}

/// Classify a record as an executable code example or a prose reference.
///
/// Code wins when it dominates the description and carries language
/// constructs; short or absent code always reads as a reference.
pub fn classify(title: &str, description: &str, code: &str) -> SnippetKind {
    let code = code.trim();
    let desc = description.trim();
    let code_len = code.chars().count();
    let desc_len = desc.chars().count();

    if code_len < 80 {
        return SnippetKind::Reference;
    }

    let code_has_markers = CODE_MARKERS.iter().any(|kw| code.contains(kw));

    if reference_title_re().is_match(title.trim())
        && !(code_has_markers && code_len > desc_len)
    {
        return SnippetKind::Reference;
    }

    if code_has_markers && code_len as f64 > desc_len as f64 * 1.2 {
        return SnippetKind::Snippet;
    }

    let total = code_len + desc_len;
    if total > 0 && code_len as f64 / total as f64 > 0.45 && code_has_markers {
        return SnippetKind::Snippet;
    }

    SnippetKind::Reference
}

/// Classify a whole batch, index-aligned with the input.
pub fn classify_items(items: &[SnippetItem]) -> Vec<SnippetKind> {
    items
        .iter()
        .map(|i| classify(&i.title, &i.description, &i.code))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BSL_CODE: &str = "Процедура Пример()\n\tЗапрос = Новый Запрос;\n\tЗапрос.Текст = \"ВЫБРАТЬ * ИЗ Справочник.Номенклатура\";\n\tРезультат = Запрос.Выполнить();\nКонецПроцедуры";

    #[test]
    fn code_dominant_items_are_snippets() {
        assert_eq!(classify("Выборка данных", "пример", BSL_CODE), SnippetKind::Snippet);
    }

    #[test]
    fn short_or_absent_code_is_reference() {
        assert_eq!(
            classify("Как настроить обмен", "длинное описание настройки", "a = 1;"),
            SnippetKind::Reference
        );
        assert_eq!(classify("Заметка", "текст", ""), SnippetKind::Reference);
    }

    #[test]
    fn howto_title_with_dominant_code_is_still_a_snippet() {
        assert_eq!(
            classify("Как выгрузить данные", "", BSL_CODE),
            SnippetKind::Snippet
        );
    }

    #[test]
    fn instructional_title_with_weak_code_is_reference() {
        let prose = "Подробная инструкция по настройке обмена данными между базами. ".repeat(10);
        let weak_code = "x = 1; // не настоящий код".repeat(5);
        assert_eq!(
            classify("Инструкция по обмену", &prose, &weak_code),
            SnippetKind::Reference
        );
    }

    #[test]
    fn folder_collection_covers_all_formats() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("query.bsl"), BSL_CODE).unwrap();
        std::fs::write(
            tmp.path().join("example.md"),
            "---\ntitle: Date formatting\ndescription: format a date\n---\n\nBody\n\n```bsl\nФормат(Дата, \"ДФ=dd.MM.yyyy\")\n```\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("README.md"), "# readme\n```bsl\nx\n```").unwrap();
        std::fs::write(tmp.path().join("no_code.md"), "# Just prose\n\nNo fence here.").unwrap();
        std::fs::write(
            tmp.path().join("extra.json"),
            r#"[{"title": "From JSON", "description": "d", "code_snippet": "Возврат Истина;"}]"#,
        )
        .unwrap();

        let items = collect_all(tmp.path()).unwrap();
        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        assert!(titles.contains(&"query"));
        assert!(titles.contains(&"Date formatting"));
        assert!(titles.contains(&"From JSON"));
        assert!(!titles.iter().any(|t| t.to_lowercase() == "readme"));
        assert_eq!(items.len(), 3);

        let from_md = items.iter().find(|i| i.title == "Date formatting").unwrap();
        assert_eq!(from_md.description, "format a date");
        assert!(from_md.code.contains("Формат"));
    }

    #[test]
    fn standards_collection_uses_heading_and_first_paragraph() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("naming.md"),
            "# Naming conventions\n\nVariables are named in full words without abbreviations.\n\nMore text.",
        )
        .unwrap();
        std::fs::write(tmp.path().join("readme.md"), "# ignore me").unwrap();

        let items = collect_standards(tmp.path());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Naming conventions");
        assert!(items[0].description.starts_with("Variables are named"));
        assert!(items[0].code.contains("# Naming conventions"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{\"not\": \"an array\"}").unwrap();
        assert!(load_json_file(&path).is_err());
    }
}
