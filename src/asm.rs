use std::fmt::Display;

use itertools::Itertools;

/// One line of emitted assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `.text`, `.globl name`, ...
    Directive(String),
    /// Label name without the trailing colon.
    Label(String),
    Instruction(String),
}

impl Line {
    pub fn instruction(&self) -> Option<&str> {
        match self {
            Line::Instruction(text) => Some(text),
            _ => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Line::Label(name) => Some(name),
            _ => None,
        }
    }
}

impl Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Line::Directive(text) | Line::Instruction(text) => write!(f, "\t{}", text),
            Line::Label(name) => write!(f, "{}:", name),
        }
    }
}

/// Assembly text of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembly {
    lines: Vec<Line>,
}

impl Assembly {
    pub fn new(lines: Vec<Line>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<Line> {
        self.lines
    }

    pub fn instructions(&self) -> impl Iterator<Item = &str> + '_ {
        self.lines.iter().filter_map(Line::instruction)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl FromIterator<Line> for Assembly {
    fn from_iter<I: IntoIterator<Item = Line>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().collect(),
        }
    }
}

impl Display for Assembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.lines.iter().join("\n"))
    }
}
