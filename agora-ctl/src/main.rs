use agora_api::{
    AuthResponse, CategoryRanking, Credentials, NewPost, Post, UserRanking, VoteDirection,
    VoteRequest, VoteResponse,
};
use anyhow::{anyhow, Context};

#[derive(structopt::StructOpt)]
struct Opt {
    /// Base url of the server, eg. `http://localhost:4000`
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Create an account and print its token
    Register { username: String, password: String },

    /// Print a fresh token for an existing account
    Login { username: String, password: String },

    /// Publish a post
    Post {
        title: String,
        content: String,

        #[structopt(long = "type")]
        category: String,

        /// Attachment url or inline data
        #[structopt(long)]
        file: Option<String>,
    },

    /// Vote on a post, direction is `up` or `down`
    VotePost { id: String, direction: VoteDirection },

    /// Vote on a comment, direction is `up` or `down`
    VoteComment { id: String, direction: VoteDirection },

    /// List the most voted posts
    Top,

    /// List the most active users
    RankUsers,

    /// List the most used categories
    RankCategories,
}

fn token() -> anyhow::Result<String> {
    std::env::var("AGORA_TOKEN").context("retrieving AGORA_TOKEN environment variable")
}

/// Sends the request, turning error responses back into the server's error
async fn send<T>(req: reqwest::RequestBuilder) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let resp = req.send().await.context("sending request")?;
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("parsing response body");
    }
    let body = resp.bytes().await.context("reading error response body")?;
    let err = agora_api::Error::parse(&body)
        .with_context(|| format!("server answered {status} with an unparseable body"))?;
    Err(anyhow!(err).context(format!("server answered {status}")))
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing server answer")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();
    let host = opt.host.trim_end_matches('/');

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::Register { username, password } => {
            let resp: AuthResponse = send(
                client
                    .post(format!("{host}/auth/register"))
                    .json(&Credentials::new(username, password)),
            )
            .await?;
            println!("{}", resp.token);
        }
        Command::Login { username, password } => {
            let resp: AuthResponse = send(
                client
                    .post(format!("{host}/auth/login"))
                    .json(&Credentials::new(username, password)),
            )
            .await?;
            println!("{}", resp.token);
        }
        Command::Post {
            title,
            content,
            category,
            file,
        } => {
            let post: Post = send(
                client
                    .post(format!("{host}/forum"))
                    .bearer_auth(token()?)
                    .json(&NewPost {
                        title,
                        content,
                        category,
                        file,
                    }),
            )
            .await?;
            println!("{}", post.id.0);
        }
        Command::VotePost { id, direction } => {
            let resp: VoteResponse = send(
                client
                    .post(format!("{host}/forum/{id}/vote"))
                    .bearer_auth(token()?)
                    .json(&VoteRequest { direction }),
            )
            .await?;
            println!("{}", resp.votes);
        }
        Command::VoteComment { id, direction } => {
            let resp: VoteResponse = send(
                client
                    .post(format!("{host}/comments/{id}/vote"))
                    .bearer_auth(token()?)
                    .json(&VoteRequest { direction }),
            )
            .await?;
            println!("{}", resp.votes);
        }
        Command::Top => {
            let posts: Vec<Post> = send(client.get(format!("{host}/forum/top"))).await?;
            print(&posts)?;
        }
        Command::RankUsers => {
            let users: Vec<UserRanking> =
                send(client.get(format!("{host}/forum/ranking/users"))).await?;
            print(&users)?;
        }
        Command::RankCategories => {
            let categories: Vec<CategoryRanking> =
                send(client.get(format!("{host}/forum/ranking/categories"))).await?;
            print(&categories)?;
        }
    }

    Ok(())
}
