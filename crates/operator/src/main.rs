//! Operator entrypoint

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data,
};
use clap::Parser;
use csrgate::{State, config::Settings, run, telemetry};
use tracing::{info, instrument};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
#[instrument(level = "info", target = "operator::main", name = "main")]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    telemetry::init()?;

    // Fail before binding anything on a bad inspector configuration
    settings.policy()?;

    let listen = settings.listen;
    let state = State::default();
    let controller = run(state.clone(), settings);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(index)
    })
    .bind(listen)?
    .shutdown_timeout(5);
    info!(%listen, "diagnostics server bound");

    let (controller, server) = tokio::join!(controller, server.run());
    controller?;
    server?;
    Ok(())
}
