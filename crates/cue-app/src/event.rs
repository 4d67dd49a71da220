use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Events published on the application bus.
#[derive(Debug, Clone)]
pub enum Event {
    Key(KeyEvent),
    Resize { cols: u16, rows: u16 },
    Quit,
}

impl Event {
    /// Map a raw key to the event the rest of the app sees. `q`, `Esc` and
    /// `Ctrl-C` quit; everything else is delivered as a key press.
    pub fn from_key(key: KeyEvent) -> Self {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Event::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Event::Quit,
            _ => Event::Key(key),
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Event::Key(_))
    }

    pub fn is_key_code(&self, code: KeyCode) -> bool {
        matches!(self, Event::Key(key) if key.code == code)
    }
}
