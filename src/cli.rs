use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Semantic search over a folder of text documents", long_about = None)]
pub struct Args {
    /// Documents folder (overrides config and DOCS_FOLDER)
    #[clap(long, global = true)]
    pub docs: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// List cached embeddings
    List {
        /// Print as json
        #[clap(long, default_value = "false")]
        json: bool,
    },
    /// Remove cached embeddings of documents no longer in the folder
    Prune {},
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Embed documents and build the index, reusing cached embeddings
    Index {
        /// Recompute every embedding even if the content is unchanged
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Search documents by meaning
    Search {
        /// Free text query
        query: String,

        /// Number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Print results as json
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show engine status
    Status {},

    /// Inspect or clean the embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Run the http api
    Serve {
        /// Address to listen on (overrides config)
        #[clap(short, long)]
        listen: Option<String>,
    },
}
