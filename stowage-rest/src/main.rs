use actix_web::{middleware, web::Data, App, HttpServer};
use stowage_rest::{routes, scope::SingleUser, settings::Settings};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt::init();

    let settings = Settings::load().unwrap();
    let ctx = Data::new(settings.to_ctx());
    let scope = Data::new(SingleUser::new("local", ""));

    ctx.streams().spawn_sweeper();

    let addr = settings.socket_addr();

    eprintln!("binding {addr}");

    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(settings.clone()))
            .app_data(ctx.clone())
            .app_data(scope.clone())
            .wrap(middleware::NormalizePath::trim())
            .wrap(middleware::Logger::default())
            .configure(routes::config)
    })
    .bind(addr)?
    .run()
    .await
}
