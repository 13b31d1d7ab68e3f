#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const SECRET_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "key",
    action: "set_key",
}];

pub(crate) const SELECTOR_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "remove",
        action: "remove_image",
    },
    CommandSpec {
        command: "use",
        action: "set_active_image",
    },
];

pub(crate) const POINT_COUNT_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "line",
        action: "line_chart",
    },
    CommandSpec {
        command: "scatter",
        action: "scatter_plot",
    },
];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "upload",
    action: "upload",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "clear_key",
        action: "clear_key",
    },
    CommandSpec {
        command: "images",
        action: "list_images",
    },
    CommandSpec {
        command: "history",
        action: "show_history",
    },
    CommandSpec {
        command: "bar",
        action: "bar_chart",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/key",
    "/clear_key",
    "/upload",
    "/images",
    "/use",
    "/remove",
    "/history",
    "/line",
    "/bar",
    "/scatter",
    "/help",
];
