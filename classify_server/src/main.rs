//! Classification server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use classify_server::{
    app,
    endpoints::ClassifyState,
    nn::{ImageClassifier, InputLayout},
    uploads::UploadDir,
};
use common::{init_logger, model::ModelSource};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:5000")]
    server_address: String,

    /// Path or http(s) URL of the ONNX classification model
    #[clap(long)]
    model: ModelSource,

    /// Comma-separated class labels in the order of the model outputs
    #[clap(long, value_delimiter = ',', required = true)]
    labels: Vec<String>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 128)]
    input_size: u32,

    /// Layout of the model input tensor
    #[clap(long, value_enum, default_value_t = InputLayout::Nhwc)]
    layout: InputLayout,

    /// Directory for temporary upload files
    #[clap(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Maximum size of an upload request in bytes
    #[clap(long, default_value_t = 16 * 1024 * 1024)]
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger();

    let model_path = args.model.fetch().await?;
    let classifier = ImageClassifier::new(&model_path, args.input_size, args.layout, args.labels)?;
    log::info!("Serving labels {:?}", classifier.labels());

    let uploads = UploadDir::new(&args.upload_dir)?;
    let state = Arc::new(ClassifyState::new(classifier, uploads));

    let app = app(state, args.max_upload_bytes);

    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
