//! LaTeX rendering for structured documents

use super::{Block, StructuredDocument};

/// Article preamble shared by every rendered document
pub const PREAMBLE: &str = r"
\documentclass[11pt,a4paper]{article}
\usepackage[a4paper,margin=2.5cm]{geometry}
\usepackage[T1]{fontenc}
\usepackage[utf8]{inputenc}
\usepackage{lmodern}
\usepackage{microtype}
\usepackage[hidelinks]{hyperref}
\usepackage{enumitem}
\usepackage{booktabs}
\usepackage{longtable}
\usepackage{array}
\usepackage{tabularx}
\usepackage{adjustbox}
\usepackage{xltabular}

\renewcommand{\arraystretch}{1.10}
\setlength{\tabcolsep}{4pt}

\setlist[itemize]{noitemsep, topsep=4pt}
\setlist[enumerate]{noitemsep, topsep=4pt}

\begin{document}
";

const WRAPPED_FIRST_COLUMN: &str = r">{\raggedright\arraybackslash}p{0.18\textwidth}";
const WRAPPED_COLUMN: &str = r">{\raggedright\arraybackslash}X";
const FULL_WIDTH_COLUMN: &str = r">{\raggedright\arraybackslash}p{\textwidth}";

/// Escape every LaTeX special character in `text`
pub fn latex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str(r"\textbackslash{}"),
            '~' => out.push_str(r"\textasciitilde{}"),
            '^' => out.push_str(r"\textasciicircum{}"),
            '{' | '}' | '$' | '&' | '#' | '%' | '_' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Render a document to standalone LaTeX source.
///
/// Output is a pure function of the input; callers validate first.
pub fn render_document(document: &StructuredDocument) -> String {
    let meta = &document.meta;
    let mut out = String::from(PREAMBLE);

    out.push_str(&format!("\\title{{{}}}\n", latex_escape(&meta.title)));
    out.push_str(&format!(
        "\\author{{{}}}\n",
        latex_escape(meta.author.as_deref().unwrap_or_default())
    ));
    out.push_str(&format!(
        "\\date{{{}}}\n",
        latex_escape(meta.date.as_deref().unwrap_or_default())
    ));
    out.push_str("\\maketitle\n");

    for block in &document.blocks {
        render_block(&mut out, block);
    }

    out.push_str("\n\\end{document}\n");
    out
}

fn render_block(out: &mut String, block: &Block) {
    match block {
        Block::H1 { text } => out.push_str(&format!("\\section*{{{}}}\n", latex_escape(text))),
        Block::H2 { text } => {
            out.push_str(&format!("\\subsection*{{{}}}\n", latex_escape(text)))
        }
        Block::H3 { text } => {
            out.push_str(&format!("\\subsubsection*{{{}}}\n", latex_escape(text)))
        }
        Block::P { text } => {
            out.push_str(&latex_escape(text));
            out.push_str("\n\n");
        }
        Block::Bullets { items } => render_list(out, "itemize", items),
        Block::Numbered { items } => render_list(out, "enumerate", items),
        Block::Table {
            columns,
            rows,
            caption,
        } => {
            if let Some(caption) = caption.as_deref().filter(|c| !c.is_empty()) {
                out.push_str(&format!("\\textbf{{{}}}\n\n", latex_escape(caption)));
            }
            render_table(out, columns, rows);
            out.push('\n');
        }
        Block::Pagebreak => out.push_str("\\clearpage\n"),
    }
}

fn render_list(out: &mut String, environment: &str, items: &[String]) {
    out.push_str(&format!("\\begin{{{}}}\n", environment));
    for item in items {
        out.push_str(&format!("  \\item {}\n", latex_escape(item)));
    }
    out.push_str(&format!("\\end{{{}}}\n\n", environment));
}

fn table_row(cells: &[String]) -> String {
    let escaped: Vec<String> = cells.iter().map(|c| latex_escape(c)).collect();
    format!("{} \\\\", escaped.join(" & "))
}

fn column_spec(columns: usize) -> String {
    if columns == 1 {
        return FULL_WIDTH_COLUMN.to_string();
    }
    let mut spec = WRAPPED_FIRST_COLUMN.to_string();
    for _ in 1..columns {
        spec.push(' ');
        spec.push_str(WRAPPED_COLUMN);
    }
    spec
}

/// Long table with a repeated header and a continuation footer
fn render_table(out: &mut String, columns: &[String], rows: &[Vec<String>]) {
    let header = table_row(columns);
    let lines = [
        r"\begingroup\small".to_string(),
        r"\setlength{\LTpre}{0pt}".to_string(),
        r"\setlength{\LTpost}{0pt}".to_string(),
        format!("\\begin{{xltabular}}{{\\textwidth}}{{{}}}", column_spec(columns.len())),
        r"\toprule".to_string(),
        header.clone(),
        r"\midrule".to_string(),
        r"\endfirsthead".to_string(),
        r"\toprule".to_string(),
        header,
        r"\midrule".to_string(),
        r"\endhead".to_string(),
        r"\midrule".to_string(),
        format!(
            "\\multicolumn{{{}}}{{c}}{{\\small \\textbf{{Continued on next page}}}} \\\\",
            columns.len()
        ),
        r"\midrule".to_string(),
        r"\endfoot".to_string(),
        r"\bottomrule".to_string(),
        r"\endlastfoot".to_string(),
        rows.iter()
            .map(|r| table_row(r))
            .collect::<Vec<_>>()
            .join("\n"),
        r"\end{xltabular}".to_string(),
        r"\endgroup".to_string(),
    ];

    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_escape_specials() {
        assert_eq!(
            latex_escape(r"50% of $x_1 & #2 {a} ~b^c \d"),
            r"50\% of \$x\_1 \& \#2 \{a\} \textasciitilde{}b\textasciicircum{}c \textbackslash{}d"
        );
        assert_eq!(latex_escape("plain text é"), "plain text é");
    }

    #[test]
    fn test_render_minimal_document() {
        let doc = StructuredDocument::new("Q3 Report");
        let tex = render_document(&doc);

        assert!(tex.starts_with(PREAMBLE));
        assert_eq!(
            &tex[PREAMBLE.len()..],
            "\\title{Q3 Report}\n\\author{}\n\\date{}\n\\maketitle\n\n\\end{document}\n"
        );
    }

    #[test]
    fn test_render_text_blocks() {
        let doc = StructuredDocument::new("T")
            .with_author("A & B")
            .with_date("2024")
            .push(Block::H1 { text: "One".into() })
            .push(Block::H2 { text: "Two".into() })
            .push(Block::H3 { text: "Three".into() })
            .push(Block::P {
                text: "100% done".into(),
            })
            .push(Block::Bullets {
                items: vec!["a".into(), "b_c".into()],
            })
            .push(Block::Numbered {
                items: vec!["first".into()],
            })
            .push(Block::Pagebreak);

        let tex = render_document(&doc);
        assert_eq!(
            &tex[PREAMBLE.len()..],
            concat!(
                "\\title{T}\n\\author{A \\& B}\n\\date{2024}\n\\maketitle\n",
                "\\section*{One}\n",
                "\\subsection*{Two}\n",
                "\\subsubsection*{Three}\n",
                "100\\% done\n\n",
                "\\begin{itemize}\n  \\item a\n  \\item b\\_c\n\\end{itemize}\n\n",
                "\\begin{enumerate}\n  \\item first\n\\end{enumerate}\n\n",
                "\\clearpage\n",
                "\n\\end{document}\n",
            )
        );
    }

    #[test]
    fn test_render_table_with_caption() {
        let mut out = String::new();
        render_block(
            &mut out,
            &Block::Table {
                columns: vec!["Item".into(), "Qty".into(), "Note".into()],
                rows: vec![vec!["Bolt".into(), "4".into(), "M6 #1".into()]],
                caption: Some("Parts".into()),
            },
        );

        let expected = [
            r"\textbf{Parts}",
            "",
            r"\begingroup\small",
            r"\setlength{\LTpre}{0pt}",
            r"\setlength{\LTpost}{0pt}",
            r"\begin{xltabular}{\textwidth}{>{\raggedright\arraybackslash}p{0.18\textwidth} >{\raggedright\arraybackslash}X >{\raggedright\arraybackslash}X}",
            r"\toprule",
            r"Item & Qty & Note \\",
            r"\midrule",
            r"\endfirsthead",
            r"\toprule",
            r"Item & Qty & Note \\",
            r"\midrule",
            r"\endhead",
            r"\midrule",
            r"\multicolumn{3}{c}{\small \textbf{Continued on next page}} \\",
            r"\midrule",
            r"\endfoot",
            r"\bottomrule",
            r"\endlastfoot",
            r"Bolt & 4 & M6 \#1 \\",
            r"\end{xltabular}",
            r"\endgroup",
            "",
            "",
        ]
        .join("\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn test_single_column_spans_text_width() {
        assert_eq!(column_spec(1), FULL_WIDTH_COLUMN);
        assert_eq!(
            column_spec(2),
            format!("{} {}", WRAPPED_FIRST_COLUMN, WRAPPED_COLUMN)
        );
    }

    #[test]
    fn test_empty_caption_is_omitted() {
        let mut out = String::new();
        render_block(
            &mut out,
            &Block::Table {
                columns: vec!["A".into()],
                rows: vec![],
                caption: Some(String::new()),
            },
        );
        assert!(out.starts_with(r"\begingroup\small"));
    }

    proptest! {
        #[test]
        fn escaped_text_has_no_bare_specials(text in ".{0,64}") {
            let escaped = latex_escape(&text);
            let mut chars = escaped.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        // every backslash starts an escape or a command
                        prop_assert!(chars.peek().is_some());
                        chars.next();
                    }
                    '$' | '&' | '#' | '%' | '_' | '~' | '^' => {
                        prop_assert!(false, "bare {:?} in {:?}", c, escaped);
                    }
                    _ => {}
                }
            }
        }

        #[test]
        fn text_without_specials_is_unchanged(text in "[a-zA-Z0-9 .,;:!?()-]{0,64}") {
            prop_assert_eq!(latex_escape(&text), text);
        }
    }
}
