use crate::{Error, Result};

/// Group numeric digits to facilitate reading long numbers
pub fn group_digits<F: std::fmt::Display>(n: F) -> String {
    use numsep::{separate, Locale};
    separate(n, Locale::English)
}

/// Parse `X,Y,Z,B` into a 4-tuple, for the CLI's raw-volume shape argument.
pub fn parse_shape4(s: &str) -> Result<(usize, usize, usize, usize)> {
    let v: Vec<&str> = s.split(',').collect();
    if v.len() != 4 {
        return Err(Error::Config(format!("expected X,Y,Z,B shape, got `{s}`")));
    }
    let parse = |t: &str| t.trim().parse::<usize>()
        .map_err(|_| Error::Config(format!("`{t}` is not a valid extent in `{s}`")));
    Ok((parse(v[0])?, parse(v[1])?, parse(v[2])?, parse(v[3])?))
}

pub mod timing {

    use super::group_digits;
    use std::time::Instant;
    use std::io::Write;

    pub struct Progress {
        previous: Instant,
    }

    impl Progress {

        #[allow(clippy::new_without_default)]
        pub fn new() -> Self { Self { previous: Instant::now() } }

        /// Print message, append ellipsis, flush stdout, stay on same line, start timer.
        pub fn start(&mut self, message: &str) {
            print!("{message} ... ");
            std::io::stdout().flush().unwrap();
            self.start_timer();
        }

        // Print time elapsed since last start or done
        pub fn done(&mut self) {
            println!("{} ms", group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        // Print message followed by time elapsed since last start or done
        pub fn done_with_message(&mut self, message: &str) {
            println!("{message}: {} ms",
                     group_digits(self.previous.elapsed().as_millis()));
            self.start_timer();
        }

        fn start_timer(&mut self) { self.previous = Instant::now() }
    }
}
