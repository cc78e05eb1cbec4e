/// Announce event. The discriminants are the UDP wire codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Event {
    /// A regular announce.
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl Event {
    /// Value of the `event` query parameter, `None` for regular announces.
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Completed => Some("completed"),
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
        }
    }
}

impl From<u32> for Event {
    fn from(value: u32) -> Self {
        match value {
            1 => Event::Completed,
            2 => Event::Started,
            3 => Event::Stopped,
            _ => Event::None,
        }
    }
}
