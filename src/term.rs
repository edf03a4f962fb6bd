//! Interactive terminal input.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};

use tracing::warn;

/// Terminal in non-canonical mode without echo.
///
/// The original terminal settings are restored on drop.
pub struct RawTerminal {
    saved: libc::termios,
    fd: RawFd,
}

impl RawTerminal {
    /// Switch the terminal behind `fd` to single-character input.
    pub fn new(fd: &impl AsRawFd) -> io::Result<Self> {
        let fd = fd.as_raw_fd();

        let saved = unsafe {
            let mut termios = MaybeUninit::<libc::termios>::uninit();
            if libc::tcgetattr(fd, termios.as_mut_ptr()) == -1 {
                return Err(io::Error::last_os_error());
            }
            termios.assume_init()
        };

        let mut raw = saved;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { saved, fd })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved) } == -1 {
            warn!("Unable to restore terminal: {}", io::Error::last_os_error());
        }
    }
}

/// Read all currently available input bytes.
///
/// An empty result means the input was closed.
pub fn read_input(fd: &impl AsRawFd) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; 64];
    let len = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(buf[..len as usize].to_vec())
}

/// Interactive single-key command.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Command {
    ToggleOverlay,
    /// Move the overlay by `(dx, dy)`.
    Move(i32, i32),
    /// Resize the overlay by `(dw, dh)`.
    Resize(i32, i32),
    ToggleTest,
    ToggleThrottle,
    ToggleBlur,
    ToggleBlank,
    ToggleRender,
    CycleAnimation,
    ToggleClear,
    Quit,
}

impl Command {
    /// Decode a key press, `None` for unbound keys.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let command = match byte {
            b'o' => Self::ToggleOverlay,
            b's' => Self::Move(0, -1),
            b'x' => Self::Move(0, 1),
            b'z' => Self::Move(-1, 0),
            b'c' => Self::Move(1, 0),
            b'S' => Self::Resize(0, -1),
            b'X' => Self::Resize(0, 1),
            b'Z' => Self::Resize(-1, 0),
            b'C' => Self::Resize(1, 0),
            b't' => Self::ToggleTest,
            b'T' => Self::ToggleThrottle,
            b'b' => Self::ToggleBlur,
            b'B' => Self::ToggleBlank,
            b'R' => Self::ToggleRender,
            b'a' => Self::CycleAnimation,
            b'r' => Self::ToggleClear,
            b'q' => Self::Quit,
            _ => return None,
        };
        Some(command)
    }
}
