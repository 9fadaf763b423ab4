#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::{Cli, Commands, ServeOptions};

    fn parse_serve(args: &[&str]) -> Result<ServeOptions, clap::Error> {
        let argv = ["leasekeep", "serve"].iter().chain(args.iter()).copied();
        match Cli::try_parse_from(argv)?.command {
            Commands::Serve(opts) => Ok(opts),
            _ => panic!("Expected serve command"),
        }
    }

    #[test]
    fn test_serve_defaults() {
        let opts = parse_serve(&[]).unwrap();
        assert_eq!(opts.reclaim_poll_ms, 250);
        assert_eq!(opts.max_in_flight, 256);
        assert_eq!(opts.key_length, 10);
        assert_eq!(opts.reclaim_max_attempts, 5);
    }

    #[test]
    fn test_zero_reclaim_poll_is_rejected() {
        assert!(parse_serve(&["--reclaim-poll-ms", "0"]).is_err());
        assert_eq!(parse_serve(&["--reclaim-poll-ms", "1"]).unwrap().reclaim_poll_ms, 1);
    }

    #[test]
    fn test_zero_max_in_flight_is_rejected() {
        assert!(parse_serve(&["--max-in-flight", "0"]).is_err());
        assert_eq!(parse_serve(&["--max-in-flight", "1"]).unwrap().max_in_flight, 1);
    }

    #[test]
    fn test_zero_key_length_and_attempts_are_rejected() {
        assert!(parse_serve(&["--key-length", "0"]).is_err());
        assert!(parse_serve(&["--reclaim-max-attempts", "0"]).is_err());
    }

    #[test]
    fn test_resources_are_comma_separated() {
        let opts = parse_serve(&["--resource", "Resource1,Resource2"]).unwrap();
        assert_eq!(opts.resources, vec!["Resource1", "Resource2"]);
    }
}
