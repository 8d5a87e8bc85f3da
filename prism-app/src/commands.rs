//! Stdin command parsing.

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/listen` (continuous) or `/listen once`.
    Listen { continuous: bool },
    /// `/stop`: stop listening.
    Stop,
    /// `/shh`: stop speaking.
    Shh,
    /// `/voice <id>`, or `/voice` alone to list voices.
    Voice(Option<String>),
    /// `/camera on|off`, or `/camera` alone to show the state.
    Camera(Option<bool>),
    Help,
    Quit,
    /// Empty line: send the last recognized phrase.
    SendDraft,
    Query(String),
    Unknown(String),
}

pub const HELP: &str = "\
commands:
  /listen          listen continuously
  /listen once     listen for one phrase
  /stop            stop listening
  /shh             stop speaking
  /voice [id]      list voices or switch voice
  /camera on|off   attach the camera frame to questions
  /quit            exit
  <text>           ask a question
  <enter>          send the last phrase heard in /listen once mode";

pub fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::SendDraft;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Query(line.to_string());
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default().to_ascii_lowercase();
    let arg = words.collect::<Vec<_>>().join(" ");
    let arg = (!arg.is_empty()).then_some(arg);

    match (name.as_str(), arg.as_deref()) {
        ("listen", None) => Command::Listen { continuous: true },
        ("listen", Some(a)) if a.eq_ignore_ascii_case("once") => {
            Command::Listen { continuous: false }
        }
        ("stop", None) => Command::Stop,
        ("shh" | "hush", None) => Command::Shh,
        ("voice", _) => Command::Voice(arg),
        ("camera", None) => Command::Camera(None),
        ("camera", Some(a)) => match a.to_ascii_lowercase().as_str() {
            "on" => Command::Camera(Some(true)),
            "off" => Command::Camera(Some(false)),
            _ => Command::Unknown(line.to_string()),
        },
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit" | "q", None) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}
