/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Background time-to-live for speculative documents.
//!
//! While the owning context is hidden, one timer per trigger class is armed.
//! Becoming visible disarms them all without touching any attempt. Expiry of
//! a class's timer is handled by the registry, which destroys every
//! non-terminal attempt of that class with `timeout_backgrounded`.

use std::time::Duration;

use prerender_core::TriggerClass;
use prerender_runtime::{TimerKey, TimerPort};

use crate::runtime::timers::TimerBook;

#[derive(Debug)]
pub struct BackgroundTimeoutMonitor {
    visible: bool,
    speculation_rules: Duration,
    embedder: Duration,
}

impl BackgroundTimeoutMonitor {
    pub fn new(speculation_rules: Duration, embedder: Duration) -> Self {
        Self {
            visible: true,
            speculation_rules,
            embedder,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn timeout_for(&self, class: TriggerClass) -> Duration {
        if class.is_speculation_rule() {
            self.speculation_rules
        } else {
            self.embedder
        }
    }

    /// Applies a visibility change. Repeating the current visibility is a
    /// no-op and returns `false`.
    pub fn set_visible<P: TimerPort + ?Sized>(
        &mut self,
        visible: bool,
        book: &mut TimerBook,
        port: &mut P,
    ) -> bool {
        if self.visible == visible {
            return false;
        }
        self.visible = visible;
        for class in TriggerClass::ALL {
            let key = TimerKey::Background(class);
            if visible {
                book.disarm(key, port);
            } else {
                book.ensure_armed(key, self.timeout_for(class), port);
            }
        }
        log::debug!("background_timeout: context visible={visible}");
        true
    }

    /// An attempt of `class` started while hidden. Re-arms the class timer if
    /// an earlier expiry already consumed it.
    pub fn attempt_started<P: TimerPort + ?Sized>(
        &self,
        class: TriggerClass,
        book: &mut TimerBook,
        port: &mut P,
    ) {
        if !self.visible {
            book.ensure_armed(TimerKey::Background(class), self.timeout_for(class), port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prerender_runtime::TimerTicket;

    #[derive(Default)]
    struct RecordingPort {
        scheduled: Vec<(TimerTicket, Duration)>,
        cancelled: Vec<TimerKey>,
    }

    impl TimerPort for RecordingPort {
        fn schedule(&mut self, ticket: TimerTicket, delay: Duration) {
            self.scheduled.push((ticket, delay));
        }

        fn cancel(&mut self, key: TimerKey) {
            self.cancelled.push(key);
        }
    }

    fn monitor() -> BackgroundTimeoutMonitor {
        BackgroundTimeoutMonitor::new(Duration::from_secs(180), Duration::from_secs(19))
    }

    #[test]
    fn hiding_twice_arms_each_class_once() {
        let mut monitor = monitor();
        let mut book = TimerBook::new();
        let mut port = RecordingPort::default();
        assert!(monitor.set_visible(false, &mut book, &mut port));
        assert!(!monitor.set_visible(false, &mut book, &mut port));
        assert_eq!(port.scheduled.len(), TriggerClass::ALL.len());
    }

    #[test]
    fn classes_use_independent_durations() {
        let mut monitor = monitor();
        let mut book = TimerBook::new();
        let mut port = RecordingPort::default();
        monitor.set_visible(false, &mut book, &mut port);
        let embedder = port
            .scheduled
            .iter()
            .find(|(t, _)| t.key == TimerKey::Background(TriggerClass::Embedder))
            .map(|(_, d)| *d);
        assert_eq!(embedder, Some(Duration::from_secs(19)));
        let rules = port
            .scheduled
            .iter()
            .find(|(t, _)| t.key == TimerKey::Background(TriggerClass::SpeculationRuleAuto))
            .map(|(_, d)| *d);
        assert_eq!(rules, Some(Duration::from_secs(180)));
    }

    #[test]
    fn showing_disarms_everything() {
        let mut monitor = monitor();
        let mut book = TimerBook::new();
        let mut port = RecordingPort::default();
        monitor.set_visible(false, &mut book, &mut port);
        monitor.set_visible(true, &mut book, &mut port);
        assert_eq!(port.cancelled.len(), TriggerClass::ALL.len());
        for class in TriggerClass::ALL {
            assert!(!book.is_armed(TimerKey::Background(class)));
        }
    }

    #[test]
    fn start_while_hidden_rearms_after_expiry() {
        let mut monitor = monitor();
        let mut book = TimerBook::new();
        let mut port = RecordingPort::default();
        monitor.set_visible(false, &mut book, &mut port);
        let key = TimerKey::Background(TriggerClass::SpeculationRule);
        let (ticket, _) = port
            .scheduled
            .iter()
            .copied()
            .find(|(t, _)| t.key == key)
            .unwrap();
        assert!(book.accept(ticket, &mut port));
        assert!(!book.is_armed(key));

        monitor.attempt_started(TriggerClass::SpeculationRule, &mut book, &mut port);
        assert!(book.is_armed(key));
    }

    #[test]
    fn start_while_visible_arms_nothing() {
        let monitor = monitor();
        let mut book = TimerBook::new();
        let mut port = RecordingPort::default();
        monitor.attempt_started(TriggerClass::Embedder, &mut book, &mut port);
        assert!(port.scheduled.is_empty());
    }
}
