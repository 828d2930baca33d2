use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Serial link settings for the board's command shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLinkConfig {
    pub baud_rate: u32,
    /// How long a single port read may block.
    pub read_timeout: Duration,
    /// How long to wait for the prompt after a command.
    pub reply_timeout: Duration,
    pub prompt: String,
    /// Initialisation attempts before giving up on a port.
    pub connect_attempts: u32,
    /// Pause after sending `reset` to a board that did not answer.
    pub reset_delay: Duration,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(10),
            reply_timeout: Duration::from_secs(1),
            prompt: "> ".to_string(),
            connect_attempts: 3,
            reset_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardTerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "Timeout error: Expected prompt '{expected}' but got '{actual}'. Likely due to a timeout."
    )]
    Timeout { expected: String, actual: String },

    #[error("Serial link closed by the board")]
    Closed,

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The shell answered with an `ERR ...` line.
    #[error("Board replied with an error: {0}")]
    Device(String),
}

impl BoardTerminalError {
    /// Whether the link itself is unusable after this error.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            BoardTerminalError::SerialPort(_)
                | BoardTerminalError::Io(_)
                | BoardTerminalError::Timeout { .. }
                | BoardTerminalError::Closed
        )
    }
}

/// Line-oriented command shell on the board: one command per line, the reply
/// ends with the prompt.
pub struct BoardTerminal<P: Read + Write + Send> {
    port: P,
    prompt: String,
    reply_timeout: Duration,
}

impl BoardTerminal<Box<dyn SerialPort>> {
    /// Open the serial port and wrap it. The shell is not touched yet, see
    /// [`BoardTerminal::initialize`].
    pub fn open(port: &str, config: &SerialLinkConfig) -> Result<Self, BoardTerminalError> {
        log::debug!("Opening {} at {} baud", port, config.baud_rate);
        let serial = serialport::new(port, config.baud_rate)
            .timeout(config.read_timeout)
            .open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self::new(serial, config))
    }
}

impl<P: Read + Write + Send> BoardTerminal<P> {
    pub fn new(port: P, config: &SerialLinkConfig) -> Self {
        Self {
            port,
            prompt: config.prompt.clone(),
            reply_timeout: config.reply_timeout,
        }
    }

    /// Bring the shell into a known state: interrupt whatever runs, then
    /// switch the prompt on and echo off.
    pub fn initialize(&mut self) -> Result<(), BoardTerminalError> {
        log::debug!("Connected to board. Sending CTRL-C to reset.");
        self.send_ctrl_c()?;
        self.drain()?;

        log::debug!("Turning on prompt");
        self.exec("prompt on", None)?;
        log::debug!("Turning off echo");
        self.exec("echo off", None)?;
        Ok(())
    }

    /// Send `command` and return the reply without the trailing prompt.
    pub fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, BoardTerminalError> {
        log::trace!("> {}", command);
        self.port.write_all(format!("{}\n", command).as_bytes())?;
        self.port.flush()?;

        let timeout = timeout.unwrap_or(self.reply_timeout);
        let prompt_bytes = self.prompt.as_bytes();
        let mut response = Vec::new();
        let now = Instant::now();

        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(0) => return Err(BoardTerminalError::Closed),
                Ok(_) => {
                    response.push(byte[0]);
                    if response.ends_with(prompt_bytes) {
                        break;
                    }
                }
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }

            // A board that keeps talking without a prompt must time out too.
            if now.elapsed() >= timeout {
                let tail = response.len().saturating_sub(2);
                return Err(BoardTerminalError::Timeout {
                    expected: self.prompt.clone(),
                    actual: String::from_utf8_lossy(&response[tail..]).to_string(),
                });
            }
        }

        response.truncate(response.len() - prompt_bytes.len());
        let reply = String::from_utf8(response)?.trim().to_string();
        log::trace!("< {}", reply);

        match reply.strip_prefix("ERR") {
            Some(message) => Err(BoardTerminalError::Device(message.trim().to_string())),
            None => Ok(reply),
        }
    }

    /// Throw away whatever is waiting in the receive buffer, for at most one
    /// reply timeout.
    fn drain(&mut self) -> Result<(), BoardTerminalError> {
        let mut scratch = [0u8; 64];
        let now = Instant::now();
        while now.elapsed() < self.reply_timeout {
            match self.port.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        log::debug!("Board still sending after {:?}, giving up on drain", self.reply_timeout);
        Ok(())
    }

    /// Send CTRL-C character
    pub fn send_ctrl_c(&mut self) -> Result<(), BoardTerminalError> {
        self.port.write_all(&[0x03])?;
        Ok(())
    }

    /// Send reset command
    pub fn send_reset(&mut self) -> Result<(), BoardTerminalError> {
        self.port.write_all(b"reset\n")?;
        Ok(())
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}


#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;

    fn quick_config() -> SerialLinkConfig {
        SerialLinkConfig {
            reply_timeout: Duration::from_millis(20),
            ..SerialLinkConfig::default()
        }
    }

    #[test]
    fn test_exec_strips_prompt() {
        let port = MockPort::new();
        port.reply("ch 3");
        let mut terminal = BoardTerminal::new(port.clone(), &quick_config());

        assert_eq!(terminal.exec("dout 0 1", None).unwrap(), "ch 3");
        assert_eq!(port.sent_lines(), vec!["dout 0 1"]);
    }

    #[test]
    fn test_err_reply_becomes_device_error() {
        let port = MockPort::new();
        port.reply("ERR nack");
        let mut terminal = BoardTerminal::new(port, &quick_config());

        let err = terminal.exec("twixfer 1 0 01 4", None).unwrap_err();
        assert!(matches!(err, BoardTerminalError::Device(ref msg) if msg == "nack"));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn test_missing_prompt_times_out() {
        let port = MockPort::new();
        port.reply_raw(b"half a rep");
        let mut terminal = BoardTerminal::new(port, &quick_config());

        let err = terminal.exec("ain 40", None).unwrap_err();
        assert!(matches!(err, BoardTerminalError::Timeout { ref actual, .. } if actual == "ep"));
        assert!(err.is_link_failure());
    }

    /// Answers every read with data and never with the prompt.
    struct ChattyPort;

    impl Read for ChattyPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(b'x');
            Ok(buf.len())
        }
    }

    impl Write for ChattyPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_endless_output_still_times_out() {
        let mut terminal = BoardTerminal::new(ChattyPort, &quick_config());
        let started = Instant::now();

        let err = terminal.exec("ain 40", None).unwrap_err();
        assert!(matches!(err, BoardTerminalError::Timeout { ref actual, .. } if actual == "xx"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_initialize_gives_up_draining_endless_output() {
        let mut terminal = BoardTerminal::new(ChattyPort, &quick_config());
        let started = Instant::now();

        // The drain returns, then `prompt on` times out on the same chatter.
        assert!(terminal.initialize().unwrap_err().is_link_failure());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_closed_port_is_link_failure() {
        let port = MockPort::new();
        let mut terminal = BoardTerminal::new(port.clone(), &quick_config());
        port.close();

        assert!(terminal.exec("aread 1", None).unwrap_err().is_link_failure());
    }

    #[test]
    fn test_initialize_sends_setup_commands() {
        let port = MockPort::new();
        port.reply("").reply("");
        let mut terminal = BoardTerminal::new(port.clone(), &quick_config());

        terminal.initialize().unwrap();
        assert_eq!(port.sent_lines(), vec!["prompt on", "echo off"]);
    }
}
