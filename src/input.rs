//! Evdev input devices the guest can grab.
//!
//! Devices are listed from the stable by-id names; only `event` nodes are
//! usable for input-linux passthrough, the legacy `mouse*` nodes are not.

use std::fs;

use crate::error::Result;

pub const INPUT_DEVICES_DIR: &str = "/dev/input/by-id";

pub fn is_input_event_device(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("event") && (name.contains("mouse") || name.contains("keyboard"))
}

fn is_mouse(name: &str) -> bool {
    name.to_lowercase().contains("mouse")
}

fn is_keyboard(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("keyboard") && !name.contains("mouse")
}

pub fn list_devices() -> Result<Vec<String>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(INPUT_DEVICES_DIR)? {
        if let Some(name) = entry?.file_name().to_str() {
            if is_input_event_device(name) {
                devices.push(name.to_string());
            }
        }
    }
    devices.sort();
    Ok(devices)
}

pub fn list_mice() -> Result<Vec<String>> {
    Ok(list_devices()?.into_iter().filter(|d| is_mouse(d)).collect())
}

pub fn list_keyboards() -> Result<Vec<String>> {
    Ok(list_devices()?.into_iter().filter(|d| is_keyboard(d)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_event_nodes_with_a_role_qualify() {
        assert!(is_input_event_device("usb-Logitech_G502-event-mouse"));
        assert!(is_input_event_device("usb-Ducky_One2-event-kbd-KEYBOARD"));
        assert!(!is_input_event_device("usb-Logitech_G502-mouse"));
        assert!(!is_input_event_device("usb-SoundCard-event-if03"));
        assert!(!is_input_event_device(""));
    }

    #[test]
    fn keyboard_classification_excludes_combined_mouse_nodes() {
        assert!(is_keyboard("usb-Ducky_One2-event-keyboard"));
        assert!(!is_keyboard("usb-Combo-event-keyboard-mouse"));
        assert!(is_mouse("usb-Logitech_G502-event-mouse"));
    }
}
