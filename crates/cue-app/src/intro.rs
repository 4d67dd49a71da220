use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use crossterm::event::KeyCode;
use ratatui::style::Color;

use cue_core::bus::{EventBus, Subscription};
use cue_core::combinators::{combine, repeat_while, scaled, Sequence};
use cue_core::script::{Script, ScriptContext};

use crate::event::Event;
use crate::screen::SharedScreen;

pub const TITLE: &str = "Welcome to cue!";
pub const PROMPT: &str = "Press any key to continue";
pub const READY: &str = "Ready. Enter restarts, q quits.";

const TYPE_DELAY: f64 = 0.1;
const BLINK: f64 = 0.2;
const PROMPT_ROW: usize = 2;
const READY_ROW: usize = 5;
const GAUGE_WIDTH: usize = 20;
/// The systems check plays at double speed.
const CHECK_SCALE: f64 = 2.0;

type Action = Box<dyn FnOnce(&mut ScriptContext<'_>) -> Result<()>>;

fn write(screen: &SharedScreen, text: impl Into<String>, col: usize, row: usize, color: Color) -> Action {
    let screen = screen.clone();
    let text = text.into();
    Box::new(move |_cx| {
        screen.borrow_mut().write(&text, col, row, color);
        Ok(())
    })
}

fn clear(screen: &SharedScreen) -> Action {
    let screen = screen.clone();
    Box::new(move |_cx| {
        screen.borrow_mut().clear();
        Ok(())
    })
}

fn clear_row(screen: &SharedScreen, row: usize) -> Action {
    let screen = screen.clone();
    Box::new(move |_cx| {
        screen.borrow_mut().clear_row(row);
        Ok(())
    })
}

type Watcher = Rc<RefCell<Option<Subscription<Event>>>>;

/// Subscribe a listener that raises `pressed` on any key.
fn watch_keys(bus: &EventBus<Event>, pressed: &Rc<Cell<bool>>, watcher: &Watcher) -> Action {
    let (bus, pressed, watcher) = (bus.clone(), pressed.clone(), watcher.clone());
    Box::new(move |_cx| {
        let subscription = bus.connect(move |ev: &Event| {
            if ev.is_key() {
                pressed.set(true);
            }
            Ok(())
        });
        *watcher.borrow_mut() = Some(subscription);
        Ok(())
    })
}

fn unwatch(watcher: &Watcher) -> Action {
    let watcher = watcher.clone();
    Box::new(move |_cx| {
        if let Some(subscription) = watcher.borrow_mut().take() {
            subscription.disconnect();
        }
        Ok(())
    })
}

/// One on/off cycle of the "press any key" prompt.
fn blink(screen: &SharedScreen) -> Sequence {
    Sequence::new()
        .call(write(screen, PROMPT, 0, PROMPT_ROW, Color::White))
        .sleep(BLINK)
        .call(clear_row(screen, PROMPT_ROW))
        .sleep(BLINK)
}

/// A labelled bar that fills one cell every `step` seconds.
fn gauge(screen: &SharedScreen, label: &str, row: usize, step: f64) -> Box<dyn Script> {
    let start = label.len() + 1;
    let mut seq = Sequence::new().call(write(screen, label, 0, row, Color::Gray));
    for cell in 0..GAUGE_WIDTH {
        seq = seq
            .sleep(step)
            .call(write(screen, "#", start + cell, row, Color::Cyan));
    }
    Box::new(seq)
}

/// The opening sequence: type the title, blink a prompt until a key is
/// pressed, then run the systems check and wait for Enter.
pub fn intro(screen: &SharedScreen, bus: &EventBus<Event>) -> Sequence {
    let mut seq = Sequence::new().call(clear(screen));
    for (col, ch) in TITLE.chars().enumerate() {
        seq = seq
            .call(write(screen, ch, col, 0, Color::Red))
            .sleep(TYPE_DELAY);
    }

    let pressed = Rc::new(Cell::new(false));
    let watcher: Watcher = Rc::default();
    let prompt = {
        let screen = screen.clone();
        let pressed = pressed.clone();
        repeat_while(move || !pressed.get(), move || blink(&screen))
    };

    seq.call(watch_keys(bus, &pressed, &watcher))
        .run(prompt)
        .call(unwatch(&watcher))
        .call(clear(screen))
        .call(write(screen, "Systems check", 0, 0, Color::White))
        .run(scaled(
            CHECK_SCALE,
            combine(vec![
                gauge(screen, "engines", 2, 0.1),
                gauge(screen, "shields", 3, 0.15),
            ]),
        ))
        .call(write(screen, READY, 0, READY_ROW, Color::Green))
        .wait_event(bus, |ev: &Event| ev.is_key_code(KeyCode::Enter))
}
