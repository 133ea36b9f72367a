use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::search::{GeoBounds, DEFAULT_TOP_K};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml and the local store.
    #[clap(long, default_value = "./")]
    pub base_dir: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GeoArgs {
    #[clap(long, allow_hyphen_values = true)]
    pub min_lat: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    pub max_lat: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    pub min_lon: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    pub max_lon: Option<f64>,
}

impl GeoArgs {
    pub fn bounds(&self) -> Option<GeoBounds> {
        GeoBounds::from_parts(self.min_lat, self.max_lat, self.min_lon, self.max_lon)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP service.
    Serve {
        /// Address to listen on
        #[clap(long, default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Scan and index a folder in the foreground.
    Index {
        /// Local directory or s3://bucket/prefix
        folder: String,

        /// Images per batch. Falls back to the configured default.
        #[clap(short, long)]
        batch_size: Option<usize>,
    },

    /// Print the images a folder would index, after dedup.
    Scan {
        /// Local directory or s3://bucket/prefix
        folder: String,
    },

    /// Search indexed images
    Search {
        /// Text query, or an image reference with --image
        query: String,

        /// Treat the query as an image path or s3 uri.
        #[clap(long, default_value = "false")]
        image: bool,

        #[clap(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        #[clap(flatten)]
        geo: GeoArgs,

        /// Lower capture time bound (date or datetime)
        #[clap(long)]
        start: Option<String>,

        /// Upper capture time bound (date or datetime)
        #[clap(long)]
        end: Option<String>,
    },

    /// Drop the configured collection.
    DeleteCollection {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let args = Args::parse_from([
            "geosearch",
            "search",
            "harbour at dusk",
            "--top-k",
            "3",
            "--min-lat",
            "-10.5",
            "--max-lat",
            "10",
            "--min-lon",
            "20",
            "--max-lon",
            "30",
            "--start",
            "2024-01-01",
        ]);

        assert_eq!(args.base_dir, "./");
        match args.command {
            Command::Search {
                query,
                image,
                top_k,
                geo,
                start,
                end,
            } => {
                assert_eq!(query, "harbour at dusk");
                assert!(!image);
                assert_eq!(top_k, 3);
                assert_eq!(geo.bounds().unwrap().min_lat, -10.5);
                assert_eq!(start.as_deref(), Some("2024-01-01"));
                assert!(end.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_partial_geo_args_mean_no_bounds() {
        let args = Args::parse_from(["geosearch", "search", "x", "--min-lat", "1"]);
        let Command::Search { geo, top_k, .. } = args.command else {
            panic!("expected search");
        };
        assert!(geo.bounds().is_none());
        assert_eq!(top_k, DEFAULT_TOP_K);
    }

    #[test]
    fn test_parse_index() {
        let args = Args::parse_from([
            "geosearch",
            "--base-dir",
            "/srv/geo",
            "index",
            "s3://bucket/run-1",
            "-b",
            "32",
        ]);
        assert_eq!(args.base_dir, "/srv/geo");
        let Command::Index { folder, batch_size } = args.command else {
            panic!("expected index");
        };
        assert_eq!(folder, "s3://bucket/run-1");
        assert_eq!(batch_size, Some(32));
    }
}
