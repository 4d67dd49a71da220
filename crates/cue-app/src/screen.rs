use std::cell::RefCell;
use std::rc::Rc;

use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};

/// Screen shared between the frame loop and the scripts that write to it.
pub type SharedScreen = Rc<RefCell<Screen>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Glyph {
    ch: char,
    color: Color,
}

const BLANK: Glyph = Glyph {
    ch: ' ',
    color: Color::Reset,
};

/// A fixed-height grid of coloured characters, addressed by column and row.
#[derive(Debug, Clone, Default)]
pub struct Screen {
    rows: Vec<Vec<Glyph>>,
}

impl Screen {
    pub fn new(height: usize) -> Self {
        Self {
            rows: vec![Vec::new(); height],
        }
    }

    pub fn shared(height: usize) -> SharedScreen {
        Rc::new(RefCell::new(Self::new(height)))
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// Write `text` starting at (`col`, `row`). Rows outside the grid are
    /// ignored; rows grow to the right as needed.
    pub fn write(&mut self, text: &str, col: usize, row: usize, color: Color) {
        let Some(line) = self.rows.get_mut(row) else {
            return;
        };
        for (offset, ch) in text.chars().enumerate() {
            let at = col + offset;
            if line.len() <= at {
                line.resize(at + 1, BLANK);
            }
            line[at] = Glyph { ch, color };
        }
    }

    pub fn clear_row(&mut self, row: usize) {
        if let Some(line) = self.rows.get_mut(row) {
            line.clear();
        }
    }

    pub fn clear(&mut self) {
        self.rows.iter_mut().for_each(Vec::clear);
    }

    #[cfg(test)]
    pub fn row_text(&self, row: usize) -> String {
        self.rows
            .get(row)
            .map(|line| line.iter().map(|g| g.ch).collect::<String>())
            .unwrap_or_default()
            .trim_end()
            .to_string()
    }

    pub fn lines(&self) -> Vec<Line<'static>> {
        self.rows
            .iter()
            .map(|line| {
                Line::from(
                    line.iter()
                        .map(|g| Span::styled(g.ch.to_string(), Style::default().fg(g.color)))
                        .collect::<Vec<_>>(),
                )
            })
            .collect()
    }
}
