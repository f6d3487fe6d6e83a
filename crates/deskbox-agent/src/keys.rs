//! Key name mapping for `xdotool key`.

/// Friendly aliases to X keysym names.
const ALIASES: &[(&str, &str)] = &[
    ("enter", "Return"),
    ("return", "Return"),
    ("space", "space"),
    ("backspace", "BackSpace"),
    ("tab", "Tab"),
    ("escape", "Escape"),
    ("esc", "Escape"),
    ("shift", "Shift_L"),
    ("shift_left", "Shift_L"),
    ("shift_right", "Shift_R"),
    ("control", "Control_L"),
    ("control_left", "Control_L"),
    ("control_right", "Control_R"),
    ("ctrl", "Control_L"),
    ("alt", "Alt_L"),
    ("alt_left", "Alt_L"),
    ("alt_right", "Alt_R"),
    ("super", "Super_L"),
    ("super_left", "Super_L"),
    ("super_right", "Super_R"),
    ("meta", "Meta_L"),
    ("caps_lock", "Caps_Lock"),
    ("num_lock", "Num_Lock"),
    ("scroll_lock", "Scroll_Lock"),
    ("insert", "Insert"),
    ("delete", "Delete"),
    ("home", "Home"),
    ("end", "End"),
    ("page_up", "Page_Up"),
    ("page_down", "Page_Down"),
    ("up", "Up"),
    ("down", "Down"),
    ("left", "Left"),
    ("right", "Right"),
    ("f1", "F1"),
    ("f2", "F2"),
    ("f3", "F3"),
    ("f4", "F4"),
    ("f5", "F5"),
    ("f6", "F6"),
    ("f7", "F7"),
    ("f8", "F8"),
    ("f9", "F9"),
    ("f10", "F10"),
    ("f11", "F11"),
    ("f12", "F12"),
    ("print_screen", "Print"),
    ("pause", "Pause"),
    ("menu", "Menu"),
];

/// Map one key name. Unknown names pass through unchanged.
pub fn map_key(key: &str) -> String {
    let lower = key.to_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, keysym)| keysym.to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Build an `xdotool key` chord from key names, e.g. `ctrl+c` → `Control_L+c`.
pub fn chord(keys: &[String]) -> String {
    keys.iter()
        .flat_map(|k| k.split('+'))
        .filter(|k| !k.is_empty())
        .map(map_key)
        .collect::<Vec<_>>()
        .join("+")
}
