use crate::image::{Image, Layer, LayerType};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubefileError {
    #[error("failed to read kubefile: {0}")]
    Io(#[from] std::io::Error),
    #[error("kubefile is empty")]
    Empty,
    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: {directive} requires an argument")]
    MissingArgument { line: usize, directive: String },
    #[error("line {line}: FROM takes exactly one image reference, got '{value}'")]
    InvalidFrom { line: usize, value: String },
    #[error("line {line}: COPY takes '<src> [dst]', got '{value}'")]
    InvalidCopy { line: usize, value: String },
    #[error("first directive of kubefile must be FROM, found {found}")]
    MissingFrom { found: String },
}

/// One parsed directive, still in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub line: usize,
    pub layer_type: LayerType,
    pub value: String,
}

/// Split a kubefile into directives.
///
/// Keywords are case-insensitive, `#` starts a comment line, and a trailing
/// `\` joins the next physical line. No structural check is made here beyond
/// per-directive arity; see [`parse_kubefile_str`].
pub fn parse_instructions(input: &str) -> Result<Vec<Instruction>, KubefileError> {
    let mut out = Vec::new();
    let mut pending = String::new();
    let mut start_line = 0;

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        if pending.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        if pending.is_empty() {
            start_line = line_no;
        }
        if let Some(head) = trimmed.strip_suffix('\\') {
            pending.push_str(head.trim_end());
            pending.push(' ');
            continue;
        }
        pending.push_str(trimmed);
        out.push(parse_directive(start_line, pending.trim())?);
        pending.clear();
    }

    if !pending.trim().is_empty() {
        out.push(parse_directive(start_line, pending.trim())?);
    }
    Ok(out)
}

fn parse_directive(line: usize, text: &str) -> Result<Instruction, KubefileError> {
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (text, ""),
    };

    let layer_type = match keyword.to_ascii_uppercase().as_str() {
        "FROM" => LayerType::Base,
        "COPY" => LayerType::Copy,
        "RUN" => LayerType::Run,
        "CMD" => LayerType::Cmd,
        _ => {
            return Err(KubefileError::UnknownDirective {
                line,
                directive: keyword.to_owned(),
            })
        }
    };

    if rest.is_empty() {
        return Err(KubefileError::MissingArgument {
            line,
            directive: keyword.to_ascii_uppercase(),
        });
    }

    let arity = rest.split_whitespace().count();
    match layer_type {
        LayerType::Base if arity != 1 => {
            return Err(KubefileError::InvalidFrom {
                line,
                value: rest.to_owned(),
            })
        }
        LayerType::Copy if arity > 2 => {
            return Err(KubefileError::InvalidCopy {
                line,
                value: rest.to_owned(),
            })
        }
        _ => {}
    }

    Ok(Instruction {
        line,
        layer_type,
        value: rest.to_owned(),
    })
}

/// Parse a kubefile into an unrealized image. The first directive must be FROM.
pub fn parse_kubefile_str(input: &str) -> Result<Image, KubefileError> {
    let instructions = parse_instructions(input)?;
    let first = instructions.first().ok_or(KubefileError::Empty)?;
    if first.layer_type != LayerType::Base {
        return Err(KubefileError::MissingFrom {
            found: first.layer_type.to_string(),
        });
    }
    if let Some(extra) = instructions
        .iter()
        .skip(1)
        .find(|i| i.layer_type == LayerType::Base)
    {
        return Err(KubefileError::UnknownDirective {
            line: extra.line,
            directive: "FROM (only allowed as the first directive)".to_owned(),
        });
    }

    let layers = instructions
        .into_iter()
        .map(|i| Layer::new(i.layer_type, i.value))
        .collect();
    Ok(Image::from_layers(layers))
}

pub fn parse_kubefile(path: impl AsRef<Path>) -> Result<Image, KubefileError> {
    let content = fs::read_to_string(path)?;
    parse_kubefile_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_directives_in_order() {
        let image = parse_kubefile_str(
            r"
# cluster image for the demo app
FROM kubernetes:v1.19.8
COPY Clusterfile etc
copy charts
RUN kubectl apply -f charts/
CMD helm install app charts/app
",
        )
        .unwrap();

        let types: Vec<_> = image.layers.iter().map(|l| l.layer_type).collect();
        assert_eq!(
            types,
            vec![
                LayerType::Base,
                LayerType::Copy,
                LayerType::Copy,
                LayerType::Run,
                LayerType::Cmd
            ]
        );
        assert_eq!(image.base_name(), Some("kubernetes:v1.19.8"));
        assert_eq!(image.layers[1].value, "Clusterfile etc");
        assert!(image.layers.iter().all(|l| l.id.is_empty()));
    }

    #[test]
    fn joins_continuation_lines() {
        let image = parse_kubefile_str("FROM scratch\nRUN echo one \\\n  && echo two\n").unwrap();
        assert_eq!(image.layers[1].value, "echo one && echo two");
    }

    #[test]
    fn rejects_missing_from() {
        let err = parse_kubefile_str("RUN echo hi\n").unwrap_err();
        assert!(matches!(err, KubefileError::MissingFrom { .. }));
        assert!(err.to_string().contains("must be FROM"));
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            parse_kubefile_str("\n# only a comment\n").unwrap_err(),
            KubefileError::Empty
        ));
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = parse_kubefile_str("FROM scratch\nENV A=b\n").unwrap_err();
        match err {
            KubefileError::UnknownDirective { line, directive } => {
                assert_eq!(line, 2);
                assert_eq!(directive, "ENV");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_second_from() {
        let err = parse_kubefile_str("FROM scratch\nFROM other\n").unwrap_err();
        assert!(matches!(err, KubefileError::UnknownDirective { line: 2, .. }));
    }

    #[test]
    fn rejects_bad_arity() {
        assert!(matches!(
            parse_kubefile_str("FROM a b\n").unwrap_err(),
            KubefileError::InvalidFrom { .. }
        ));
        assert!(matches!(
            parse_kubefile_str("FROM scratch\nCOPY a b c\n").unwrap_err(),
            KubefileError::InvalidCopy { .. }
        ));
        assert!(matches!(
            parse_kubefile_str("FROM scratch\nRUN\n").unwrap_err(),
            KubefileError::MissingArgument { .. }
        ));
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Kubefile");
        fs::write(&path, "FROM scratch\nCOPY Clusterfile\n").unwrap();
        let image = parse_kubefile(&path).unwrap();
        assert!(image.is_scratch());
        assert_eq!(image.layers.len(), 2);
    }
}
